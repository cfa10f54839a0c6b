//! Input binding templates
//!
//! Node `input` values are rendered against the run context before each
//! attempt. The context has four roots:
//!
//! - `trigger`: the payload the run was started with
//! - `steps`: outputs of completed steps, keyed by step id
//! - `run`: run metadata (`id`, `graph`)
//! - `loop`: the innermost loop frame (`index`, `item`, `node`), when inside a loop body
//!
//! # Example
//!
//! ```ignore
//! use agent_flow::template::TemplateEngine;
//! use serde_json::json;
//!
//! let engine = TemplateEngine::new();
//! let ctx = json!({"trigger": {"subject": "Invoice overdue"}});
//! let bindings = json!({"title": "Re: {{ trigger.subject }}"});
//!
//! let params = engine.render_bindings(bindings.as_object().unwrap(), &ctx)?;
//! assert_eq!(params["title"], "Re: Invoice overdue");
//! ```

mod engine;
mod errors;
mod filters;

pub use engine::TemplateEngine;
pub use errors::TemplateError;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bindings_across_roots() {
        let engine = TemplateEngine::new();
        let ctx = json!({
            "trigger": {"to": "ops@example.com"},
            "steps": {"classify": {"label": "billing", "score": 0.92}},
            "run": {"id": "r-1", "graph": "triage"},
            "loop": {"index": 0, "item": {"id": "m1"}, "node": "each"}
        });
        let bindings = json!({
            "to": "{{ trigger.to }}",
            "subject": "[{{ steps.classify.label | upper }}] run {{ run.id }}",
            "score": "{{ steps.classify.score }}",
            "message": "{{ loop.item.id }}",
            "payload": "{{ steps.classify | json }}"
        });

        let params = engine
            .render_bindings(bindings.as_object().unwrap(), &ctx)
            .unwrap();

        assert_eq!(params["to"], "ops@example.com");
        assert_eq!(params["subject"], "[BILLING] run r-1");
        assert_eq!(params["score"], json!(0.92));
        assert_eq!(params["message"], "m1");
        let payload: serde_json::Value =
            serde_json::from_str(params["payload"].as_str().unwrap()).unwrap();
        assert_eq!(payload["label"], "billing");
    }

    #[test]
    fn test_missing_step_output_is_an_error() {
        let engine = TemplateEngine::new();
        let ctx = json!({"trigger": {}, "steps": {}});
        let bindings = json!({"x": "value: {{ steps.fetch.body }}"});
        assert!(
            engine
                .render_bindings(bindings.as_object().unwrap(), &ctx)
                .is_err()
        );
    }
}
