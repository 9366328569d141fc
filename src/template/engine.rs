//! Template engine for provisioner specs
//!
//! Every string leaf of a provisioner spec (outside `provisioningModes`) is
//! a Jinja-style template evaluated over a per-phase context. Evaluation is
//! pure except for two explicit hooks: the `get_pvc(name, namespace)`
//! function, which reads a claim through the Kubernetes client, and the
//! `tobash`/`tojson` filters.

use std::fmt::Write as _;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{Api, Client};
use minijinja::value::ValueKind;
use minijinja::{Environment, ErrorKind, Value};

use super::error::TemplateError;
use super::filters;

/// Template engine for provisioner spec evaluation.
///
/// Expressions may evaluate to strings, numbers, or booleans; anything else
/// (including undefined) fails the evaluating phase. Statement-only lines
/// are stripped together with their leading whitespace and trailing newline.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create an engine without the `get_pvc` hook, for pure evaluation.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an engine whose `get_pvc` function reads claims through the
    /// given client.
    pub fn with_client(client: Client) -> Self {
        Self::build(Some(client))
    }

    fn build(client: Option<Client>) -> Self {
        let mut env = Environment::new();

        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);

        // Expressions may be combined with `or` over undefined values, but a
        // template must never *emit* undefined or a non-scalar.
        env.set_formatter(|out, _state, value| match value.kind() {
            ValueKind::Undefined => Err(minijinja::Error::new(
                ErrorKind::UndefinedError,
                "expressions must not evaluate to undefined",
            )),
            ValueKind::String | ValueKind::Number | ValueKind::Bool => write!(out, "{value}")
                .map_err(|_| {
                    minijinja::Error::new(ErrorKind::WriteFailure, "failed to write output")
                }),
            other => Err(minijinja::Error::new(
                ErrorKind::InvalidOperation,
                format!("expressions must evaluate to a string or numeric value, got {other}"),
            )),
        });

        env.add_filter("tobash", filters::tobash);
        env.add_filter("tojson", filters::tojson);

        if let Some(client) = client {
            env.add_function(
                "get_pvc",
                move |name: String, namespace: String| -> Result<Value, minijinja::Error> {
                    let client = client.clone();
                    let pvc = tokio::task::block_in_place(|| {
                        tokio::runtime::Handle::current().block_on({
                            let name = name.clone();
                            let namespace = namespace.clone();
                            async move {
                                let api: Api<PersistentVolumeClaim> =
                                    Api::namespaced(client, &namespace);
                                api.get(&name).await
                            }
                        })
                    })
                    .map_err(|e| {
                        minijinja::Error::new(
                            ErrorKind::InvalidOperation,
                            format!("get_pvc({name:?}, {namespace:?}): {e}"),
                        )
                    })?;
                    Ok(Value::from_serialize(&pvc))
                },
            );
        }

        Self { env }
    }

    /// Check the syntax of a single template without rendering it.
    pub fn check_syntax(&self, template: &str) -> Result<(), minijinja::Error> {
        self.env.template_from_str(template).map(|_| ())
    }

    /// Check the syntax of every string leaf in `value`.
    pub fn check_tree_syntax(&self, value: &serde_json::Value) -> Result<(), TemplateError> {
        self.walk_syntax(value, String::new())
    }

    fn walk_syntax(&self, value: &serde_json::Value, path: String) -> Result<(), TemplateError> {
        match value {
            serde_json::Value::String(s) => {
                self.check_syntax(s)
                    .map_err(|source| TemplateError::Render { path, source })
            }
            serde_json::Value::Object(map) => {
                for (key, child) in map {
                    self.walk_syntax(child, join_key(&path, key))?;
                }
                Ok(())
            }
            serde_json::Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    self.walk_syntax(child, join_index(&path, index))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Evaluate every string leaf of `value` as a template over `context`,
    /// returning the substituted tree. The input is not mutated.
    ///
    /// A leaf whose template sets `yaml = true` has its output re-parsed as
    /// YAML; the parsed subtree replaces the leaf and is not re-evaluated.
    pub fn evaluate_tree(
        &self,
        value: &serde_json::Value,
        context: &Value,
    ) -> Result<serde_json::Value, TemplateError> {
        self.walk_evaluate(value, context, String::new())
    }

    fn walk_evaluate(
        &self,
        value: &serde_json::Value,
        context: &Value,
        path: String,
    ) -> Result<serde_json::Value, TemplateError> {
        match value {
            serde_json::Value::String(s) => self.evaluate_leaf(s, context, path),
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, child) in map {
                    let evaluated = self.walk_evaluate(child, context, join_key(&path, key))?;
                    out.insert(key.clone(), evaluated);
                }
                Ok(serde_json::Value::Object(out))
            }
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, child) in items.iter().enumerate() {
                    out.push(self.walk_evaluate(child, context, join_index(&path, index))?);
                }
                Ok(serde_json::Value::Array(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn evaluate_leaf(
        &self,
        template: &str,
        context: &Value,
        path: String,
    ) -> Result<serde_json::Value, TemplateError> {
        let tmpl = self
            .env
            .template_from_str(template)
            .map_err(|source| TemplateError::Render {
                path: path.clone(),
                source,
            })?;

        let (rendered, state) =
            tmpl.render_and_return_state(context)
                .map_err(|source| TemplateError::Render {
                    path: path.clone(),
                    source,
                })?;

        let reparse = match state.lookup("yaml") {
            None => false,
            Some(flag) if flag.kind() == ValueKind::Bool => flag.is_true(),
            Some(_) => return Err(TemplateError::YamlFlag { path }),
        };

        if reparse {
            serde_yaml::from_str(&rendered).map_err(|e| TemplateError::Reparse {
                path,
                message: e.to_string(),
            })
        } else {
            Ok(serde_json::Value::String(rendered))
        }
    }

    /// Whether a string contains a template-opening token.
    pub fn has_template_syntax(s: &str) -> bool {
        s.contains("{{") || s.contains("{%") || s.contains("{#")
    }
}

fn join_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn join_index(path: &str, index: usize) -> String {
    format!("{path}[{index}]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluate(obj: serde_json::Value, context: serde_json::Value) -> Result<serde_json::Value, TemplateError> {
        let engine = TemplateEngine::new();
        engine.evaluate_tree(&obj, &Value::from_serialize(&context))
    }

    #[test]
    fn non_strings_pass_through() {
        for obj in [json!(null), json!(42), json!(true)] {
            assert_eq!(evaluate(obj.clone(), json!({})).unwrap(), obj);
        }
    }

    #[test]
    fn plain_strings_pass_through() {
        for obj in [json!(""), json!(" \n "), json!("hello")] {
            assert_eq!(evaluate(obj.clone(), json!({})).unwrap(), obj);
        }
    }

    #[test]
    fn expressions_substitute_into_strings() {
        assert_eq!(evaluate(json!("a{{ '42' }}b"), json!({})).unwrap(), json!("a42b"));
        assert_eq!(evaluate(json!("{{ 1 + 2 }}"), json!({})).unwrap(), json!("3"));
        assert_eq!(evaluate(json!("{{ 42 }}"), json!({})).unwrap(), json!("42"));
    }

    #[test]
    fn trees_evaluate_recursively() {
        let obj = json!({
            "a": {"1": "ab{% if b == 3 %}c{% endif %}{% if x is defined %}d{% endif %}"},
            "b": ["hello", "{{ a + b * c }}"],
        });
        let context = json!({"a": 2, "b": 3, "c": 4});
        assert_eq!(
            evaluate(obj, context).unwrap(),
            json!({"a": {"1": "abc"}, "b": ["hello", "14"]})
        );
    }

    #[test]
    fn context_variables_resolve() {
        let result = evaluate(json!("{{ params.level }}"), json!({"params": {"level": "fast"}}));
        assert_eq!(result.unwrap(), json!("fast"));
    }

    #[test]
    fn yaml_flag_reparses_the_leaf() {
        assert_eq!(
            evaluate(json!("{% set yaml = true %}{{ 42 }}"), json!({})).unwrap(),
            json!(42)
        );
        assert_eq!(
            evaluate(json!("{% set yaml = true %}{{ 1 + 2 }}"), json!({})).unwrap(),
            json!(3)
        );
        assert_eq!(
            evaluate(
                json!(r#"{% set yaml = true %}x: {{ '[1, "2", 3]' }}"#),
                json!({})
            )
            .unwrap(),
            json!({"x": [1, "2", 3]})
        );
    }

    #[test]
    fn yaml_flag_with_empty_output_yields_null() {
        for obj in [
            json!("{% set yaml = true %}{{ '' }}"),
            json!("{% set yaml = true %}{{ ' \n ' }}"),
        ] {
            assert_eq!(evaluate(obj, json!({})).unwrap(), json!(null));
        }
    }

    #[test]
    fn yaml_flag_false_keeps_the_string() {
        assert_eq!(
            evaluate(json!("{% set yaml = false %}hello"), json!({})).unwrap(),
            json!("hello")
        );
        assert_eq!(
            evaluate(json!("{% set yaml = true %}hello"), json!({})).unwrap(),
            json!("hello")
        );
    }

    #[test]
    fn reparsed_subtrees_are_not_reevaluated() {
        // the template text carried through the context survives as a
        // literal string in the parsed subtree
        let obj = json!("{% set yaml = true %}inner: '{{ t }}'");
        let context = json!({"t": "{{ 1 + 1 }}"});
        assert_eq!(
            evaluate(obj, context).unwrap(),
            json!({"inner": "{{ 1 + 1 }}"})
        );
    }

    #[test]
    fn syntax_errors_fail() {
        for obj in [json!("{{"), json!("{{ }}")] {
            assert!(evaluate(obj, json!({})).is_err());
        }
    }

    #[test]
    fn undefined_output_fails_but_or_recovers() {
        assert!(evaluate(json!("{{ abc }}"), json!({})).is_err());
        assert!(evaluate(json!("{{ (abc + 3) or 42 }}"), json!({})).is_err());
        assert_eq!(
            evaluate(json!("{% set yaml = true %}{{ abc or 42 }}"), json!({})).unwrap(),
            json!(42)
        );
    }

    #[test]
    fn non_scalar_expression_output_fails() {
        assert!(evaluate(json!(r#"x: {{ [1, "2", 3] }}"#), json!({})).is_err());
    }

    #[test]
    fn statement_only_lines_are_stripped() {
        let obj = json!("  {% if true %}\nvalue\n  {% endif %}\n");
        assert_eq!(evaluate(obj, json!({})).unwrap(), json!("value\n"));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let obj = json!({"cmd": "{{ params.name | tobash }}", "n": "{{ 1 + 1 }}"});
        let context = json!({"params": {"name": "a b"}});
        let first = evaluate(obj.clone(), context.clone()).unwrap();
        let second = evaluate(obj, context).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn error_messages_are_keyed_by_path() {
        let obj = json!({"podTemplate": {"spec": {"containers": [{"image": "{{ missing }}"}]}}});
        let err = evaluate(obj, json!({})).unwrap_err();
        assert!(err
            .to_string()
            .contains("podTemplate.spec.containers[0].image"));
    }

    #[test]
    fn tree_syntax_check_accepts_valid_and_rejects_broken_templates() {
        let engine = TemplateEngine::new();
        engine
            .check_tree_syntax(&json!({"a": ["{{ x }}", {"b": "{% if y %}z{% endif %}"}]}))
            .unwrap();

        let err = engine
            .check_tree_syntax(&json!({"a": ["ok", "{% if %}"]}))
            .unwrap_err();
        assert!(err.to_string().contains("a[1]"));
    }

    #[test]
    fn template_syntax_detection() {
        assert!(TemplateEngine::has_template_syntax("{{ x }}"));
        assert!(TemplateEngine::has_template_syntax("{% set a = 1 %}"));
        assert!(TemplateEngine::has_template_syntax("{# note #}"));
        assert!(!TemplateEngine::has_template_syntax("10Gi"));
        assert!(!TemplateEngine::has_template_syntax("$ {not a template}"));
    }
}
