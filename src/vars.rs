//! Template variable substitution for service commands and backend addresses
//!
//! Templates use brace placeholders:
//! - `{xdg_run}` / `{xdg_state}`: the current service's runtime and state dirs
//! - `{api.xdg_run}` / `{api.xdg_state}`: the dirs of service `api`
//! - `{{` / `}}`: literal braces

use crate::dirs::DirectoryScope;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub const RUNTIME_VAR: &str = "xdg_run";
pub const STATE_VAR: &str = "xdg_state";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown variable '{name}' in '{template}'")]
    UnknownVariable { name: String, template: String },

    #[error("unterminated placeholder in '{0}'")]
    Unterminated(String),

    #[error("single '}}' encountered in '{0}'")]
    UnmatchedBrace(String),
}

/// Substitute every placeholder in `template` using `lookup`.
///
/// This is the parser shared by resolution and load-time validation.
pub fn substitute<F>(template: &str, mut lookup: F) -> Result<String, TemplateError>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let brace = rest.as_bytes()[pos];
        let after = &rest[pos + 1..];

        if after.as_bytes().first() == Some(&brace) {
            out.push(brace as char);
            rest = &after[1..];
            continue;
        }
        if brace == b'}' {
            return Err(TemplateError::UnmatchedBrace(template.to_string()));
        }

        let end = after
            .find('}')
            .ok_or_else(|| TemplateError::Unterminated(template.to_string()))?;
        let name = &after[..end];
        let value = lookup(name).ok_or_else(|| TemplateError::UnknownVariable {
            name: name.to_string(),
            template: template.to_string(),
        })?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Check that `template` parses and only names known variables.
///
/// `allow_local` admits the unqualified `{xdg_run}` / `{xdg_state}` forms,
/// which only make sense for service commands.
pub fn validate<'a, I>(template: &str, services: I, allow_local: bool) -> Result<(), TemplateError>
where
    I: IntoIterator<Item = &'a str> + Clone,
{
    substitute(template, |name| {
        let known = match name.split_once('.') {
            Some((service, var)) => {
                is_scope_var(var) && services.clone().into_iter().any(|s| s == service)
            }
            None => allow_local && is_scope_var(name),
        };
        known.then(String::new)
    })
    .map(|_| ())
}

fn is_scope_var(name: &str) -> bool {
    name == RUNTIME_VAR || name == STATE_VAR
}

fn scope_var(scope: &DirectoryScope, name: &str) -> Option<PathBuf> {
    match name {
        RUNTIME_VAR => Some(scope.runtime_dir()),
        STATE_VAR => Some(scope.state_dir()),
        _ => None,
    }
}

/// Resolves templates against a set of service scopes
#[derive(Debug, Clone, Default)]
pub struct VarResolver {
    local: Option<DirectoryScope>,
    services: Arc<BTreeMap<String, DirectoryScope>>,
}

impl VarResolver {
    /// Qualified access to each named service, each scoped below `scope`
    pub fn for_services<'a, I>(scope: &DirectoryScope, names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let services = names
            .into_iter()
            .map(|name| (name.to_string(), scope.join(name)))
            .collect();
        Self {
            local: None,
            services: Arc::new(services),
        }
    }

    /// Same qualified access, plus unqualified variables bound to `scope`
    pub fn with_local(&self, scope: DirectoryScope) -> Self {
        Self {
            local: Some(scope),
            services: Arc::clone(&self.services),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<PathBuf> {
        match name.split_once('.') {
            Some((service, var)) => scope_var(self.services.get(service)?, var),
            None => scope_var(self.local.as_ref()?, name),
        }
    }

    pub fn resolve(&self, template: &str) -> Result<String, TemplateError> {
        substitute(template, |name| {
            self.lookup(name)
                .map(|path| path.to_string_lossy().into_owned())
        })
    }

    pub fn resolve_all(&self, templates: &[String]) -> Result<Vec<String>, TemplateError> {
        templates.iter().map(|t| self.resolve(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirs::BaseDirs;

    fn resolver() -> VarResolver {
        let scope = DirectoryScope::new(
            BaseDirs::new("/run/test/devgate", "/test/.local/state/devgate"),
            "testapp",
        );
        VarResolver::for_services(&scope, ["app1", "app2"]).with_local(scope.join("app1"))
    }

    #[test]
    fn test_resolve_local_runtime_dir() {
        assert_eq!(
            resolver().resolve("{xdg_run}/app.sock").unwrap(),
            "/run/test/devgate/testapp/app1/app.sock"
        );
    }

    #[test]
    fn test_resolve_local_state_dir() {
        assert_eq!(
            resolver().resolve("--db={xdg_state}/db.sqlite").unwrap(),
            "--db=/test/.local/state/devgate/testapp/app1/db.sqlite"
        );
    }

    #[test]
    fn test_resolve_other_service() {
        assert_eq!(
            resolver().resolve("{app2.xdg_run}/app2.sock").unwrap(),
            "/run/test/devgate/testapp/app2/app2.sock"
        );
    }

    #[test]
    fn test_plain_text_passes_through() {
        assert_eq!(resolver().resolve("--port=8080").unwrap(), "--port=8080");
        assert_eq!(resolver().resolve("").unwrap(), "");
    }

    #[test]
    fn test_escaped_braces() {
        assert_eq!(
            resolver().resolve("{{\"a\": 1}} {xdg_run}").unwrap(),
            "{\"a\": 1} /run/test/devgate/testapp/app1"
        );
    }

    #[test]
    fn test_unknown_variable() {
        let err = resolver().resolve("{home}/x").unwrap_err();
        assert_eq!(
            err,
            TemplateError::UnknownVariable {
                name: "home".to_string(),
                template: "{home}/x".to_string(),
            }
        );

        assert!(matches!(
            resolver().resolve("{app3.xdg_run}"),
            Err(TemplateError::UnknownVariable { .. })
        ));
        assert!(matches!(
            resolver().resolve("{app2.home}"),
            Err(TemplateError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn test_malformed_templates() {
        assert!(matches!(
            resolver().resolve("{xdg_run"),
            Err(TemplateError::Unterminated(_))
        ));
        assert!(matches!(
            resolver().resolve("a}b"),
            Err(TemplateError::UnmatchedBrace(_))
        ));
    }

    #[test]
    fn test_unqualified_requires_local_scope() {
        let scope = DirectoryScope::new(BaseDirs::new("/r", "/s"), "x");
        let gateway = VarResolver::for_services(&scope, ["api"]);
        assert!(gateway.resolve("{xdg_run}").is_err());
        assert_eq!(gateway.resolve("{api.xdg_run}/s").unwrap(), "/r/x/api/s");
    }

    #[test]
    fn test_resolve_all() {
        let args = vec!["--uds".to_string(), "{xdg_run}/app.sock".to_string()];
        assert_eq!(
            resolver().resolve_all(&args).unwrap(),
            vec!["--uds", "/run/test/devgate/testapp/app1/app.sock"]
        );
    }

    #[test]
    fn test_validate() {
        let names = ["api", "web"];
        assert!(validate("{api.xdg_run}/app.sock", names, false).is_ok());
        assert!(validate("{xdg_state}/db", names, true).is_ok());
        assert!(validate("{xdg_state}/db", names, false).is_err());
        assert!(validate("{worker.xdg_run}", names, true).is_err());
        assert!(validate("{api.xdg_run", names, true).is_err());
    }
}
