//! Environment variable templating.
//!
//! Every inherited environment variable value is treated as a template and
//! rendered against the data map built from the fetched secrets, so a child
//! can be launched with e.g. `APP_PASSWORD={{ kv.app.data.password }}`.
//! Templates are compiled once and rendered in strict mode: a reference to a
//! key that is not present in the context fails the render instead of
//! producing an empty string. A `json` helper encodes any subtree as JSON
//! text.

use std::collections::BTreeMap;

use handlebars::{
    Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderErrorReason,
};

use crate::error::TemplateError;
use crate::secret::DataMap;

/// A compiled template for a single environment variable value.
pub struct EnvTemplate {
    key: String,
    registry: Handlebars<'static>,
}

impl EnvTemplate {
    /// Compile the template body of environment variable `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Parse`] if the value does not parse as a
    /// template.
    pub fn new(key: &str, value: &str) -> Result<Self, TemplateError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        // Values land in a child environment, not in HTML; `&`, `=`, quotes
        // and the rest must pass through byte-for-byte.
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_helper("json", Box::new(json_helper));
        registry
            .register_template_string(key, value)
            .map_err(|source| TemplateError::Parse {
                key: key.to_owned(),
                source: Box::new(source),
            })?;

        Ok(Self {
            key: key.to_owned(),
            registry,
        })
    }

    /// Render the template against the given data map. Reusable and
    /// side-effect free.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Render`] if a referenced key is missing from
    /// the context or a helper fails.
    pub fn render(&self, context: &DataMap) -> Result<String, TemplateError> {
        self.registry
            .render(&self.key, context)
            .map_err(|source| TemplateError::Render {
                key: self.key.clone(),
                source: Box::new(source),
            })
    }
}

impl std::fmt::Debug for EnvTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvTemplate")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// `{{ json some.subtree }}` — encode an arbitrary context node as JSON.
fn json_helper(
    h: &Helper<'_>,
    _: &Handlebars<'_>,
    _: &Context,
    _: &mut RenderContext<'_, '_>,
    out: &mut dyn Output,
) -> HelperResult {
    let param = h
        .param(0)
        .ok_or(RenderErrorReason::ParamNotFoundForIndex("json", 0))?;
    let encoded = serde_json::to_string(param.value())
        .map_err(|err| RenderErrorReason::NestedError(Box::new(err)))?;
    out.write(&encoded)?;

    Ok(())
}

/// Whether an environment variable is withheld from the child. `INIT_*`
/// keys are always filtered; `VAULT_*` keys are filtered when token
/// inheritance is disabled.
#[must_use]
pub fn is_key_filtered(key: &str, no_inherit_token: bool) -> bool {
    if key.starts_with("INIT_") {
        return true;
    }

    key.starts_with("VAULT_") && no_inherit_token
}

/// Render a full environment snapshot: apply `overrides` on top of
/// `base_env`, drop filtered keys, then compile and render every remaining
/// value against `context`. Keys are emitted in sorted order so snapshots
/// are deterministic.
///
/// # Errors
///
/// Returns [`TemplateError`] if any value fails to parse or render.
pub fn render_environment(
    base_env: &[(String, String)],
    overrides: &[(String, String)],
    no_inherit_token: bool,
    context: &DataMap,
) -> Result<Vec<String>, TemplateError> {
    let mut merged: BTreeMap<&str, &str> = base_env
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();
    for (key, value) in overrides {
        merged.insert(key, value);
    }

    let mut snapshot = Vec::with_capacity(merged.len());
    for (key, value) in merged {
        if is_key_filtered(key, no_inherit_token) {
            continue;
        }

        let template = EnvTemplate::new(key, value)?;
        let rendered = template.render(context)?;
        snapshot.push(format!("{key}={rendered}"));
    }

    Ok(snapshot)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(value: serde_json::Value) -> DataMap {
        match value {
            serde_json::Value::Object(map) => map,
            _ => DataMap::new(),
        }
    }

    #[test]
    fn literal_value_renders_unchanged() {
        let template = EnvTemplate::new("HOME", "/home/app").unwrap();
        assert_eq!(template.render(&DataMap::new()).unwrap(), "/home/app");
    }

    #[test]
    fn interpolation_resolves_nested_keys() {
        let template = EnvTemplate::new("APP_PASSWORD", "{{ kv.app.data.password }}").unwrap();
        let ctx = context(json!({"kv": {"app": {"data": {"password": "hunter2"}}}}));
        assert_eq!(template.render(&ctx).unwrap(), "hunter2");
    }

    #[test]
    fn special_characters_pass_through_unescaped() {
        let template = EnvTemplate::new("APP_PASSWORD", "{{ kv.app.data.password }}").unwrap();
        let ctx = context(json!({"kv": {"app": {"data": {"password": "p@ss&w/rd="}}}}));
        assert_eq!(template.render(&ctx).unwrap(), "p@ss&w/rd=");

        let template = EnvTemplate::new("APP_KEY", "{{ kv.app.data.key }}").unwrap();
        let ctx = context(json!({"kv": {"app": {"data": {"key": "<a>\"b\"&'c'=dGVzdA=="}}}}));
        assert_eq!(template.render(&ctx).unwrap(), "<a>\"b\"&'c'=dGVzdA==");
    }

    #[test]
    fn missing_key_fails_render() {
        let template = EnvTemplate::new("APP_PASSWORD", "{{ kv.app.data.password }}").unwrap();
        let err = template.render(&DataMap::new()).unwrap_err();
        assert!(matches!(err, TemplateError::Render { .. }));
    }

    #[test]
    fn unparseable_template_fails_construction() {
        let err = EnvTemplate::new("BROKEN", "{{ unclosed").unwrap_err();
        assert!(matches!(err, TemplateError::Parse { .. }));
    }

    #[test]
    fn json_helper_encodes_subtree() {
        let template = EnvTemplate::new("APP_CONFIG", "{{ json kv.app }}").unwrap();
        let ctx = context(json!({"kv": {"app": {"port": 8080}}}));
        assert_eq!(template.render(&ctx).unwrap(), r#"{"port":8080}"#);
    }

    #[test]
    fn init_keys_are_always_filtered() {
        assert!(is_key_filtered("INIT_PATHS", false));
        assert!(is_key_filtered("INIT_PATHS", true));
    }

    #[test]
    fn vault_keys_are_filtered_only_without_inheritance() {
        assert!(!is_key_filtered("VAULT_ADDR", false));
        assert!(is_key_filtered("VAULT_ADDR", true));
        assert!(!is_key_filtered("PATH", true));
    }

    #[test]
    fn snapshot_applies_overrides_and_filters() {
        let base = vec![
            ("PATH".to_owned(), "/usr/bin".to_owned()),
            ("INIT_PATHS".to_owned(), "kv/app".to_owned()),
            ("VAULT_TOKEN".to_owned(), "bootstrap".to_owned()),
        ];
        let overrides = vec![("VAULT_TOKEN".to_owned(), "derived".to_owned())];

        let snapshot = render_environment(&base, &overrides, false, &DataMap::new()).unwrap();
        assert_eq!(snapshot, vec!["PATH=/usr/bin", "VAULT_TOKEN=derived"]);

        let filtered = render_environment(&base, &overrides, true, &DataMap::new()).unwrap();
        assert_eq!(filtered, vec!["PATH=/usr/bin"]);
    }
}
