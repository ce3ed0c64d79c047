//! Built-in tools every connection registers.

use super::{FunctionRegistry, ToolAction, ToolContext};
use chrono::Local;

/// Refusal spoken when a non-owner asks for an owner-only tool.
const OWNER_ONLY: &str = "Sorry, only the device owner can switch roles.";

/// Register the stock tool set.
pub fn register_builtins(registry: &mut FunctionRegistry) {
    registry.register(
        serde_json::json!({
            "name": "get_time",
            "description": "Get the current local time (HH:MM).",
            "parameters": { "type": "object", "properties": {} }
        }),
        |_context, _args| {
            Ok(ToolAction::RequeryLlm(
                Local::now().format("%H:%M").to_string(),
            ))
        },
    );

    registry.register(
        serde_json::json!({
            "name": "get_date",
            "description": "Get today's date, including the weekday.",
            "parameters": { "type": "object", "properties": {} }
        }),
        |_context, _args| {
            Ok(ToolAction::RequeryLlm(
                Local::now().format("%Y-%m-%d %A").to_string(),
            ))
        },
    );

    registry.register(
        serde_json::json!({
            "name": "handle_exit_intent",
            "description": "Call when the user wants to end the conversation.",
            "parameters": {
                "type": "object",
                "properties": {
                    "say_goodbye": {
                        "type": "string",
                        "description": "Farewell line to speak before closing."
                    }
                }
            }
        }),
        |_context, args| {
            let farewell = args
                .get("say_goodbye")
                .and_then(|s| s.as_str())
                .unwrap_or("Goodbye!")
                .to_owned();
            Ok(ToolAction::Exit { farewell })
        },
    );

    registry.register(
        serde_json::json!({
            "name": "change_role",
            "description": "Switch the assistant to another configured role. Only the device owner may do this.",
            "parameters": {
                "type": "object",
                "properties": {
                    "role": { "type": "string", "description": "Name of the role to activate." }
                },
                "required": ["role"]
            }
        }),
        |context, args| {
            // Persona controls are owner-only.
            if !context.is_admin {
                return Ok(ToolAction::Respond(OWNER_ONLY.to_owned()));
            }
            let role = args
                .get("role")
                .and_then(|r| r.as_str())
                .unwrap_or_default()
                .to_owned();
            Ok(ToolAction::SwitchRole { role })
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> ToolContext {
        ToolContext {
            speaker_id: Some("speaker_0".to_owned()),
            is_admin: true,
        }
    }

    #[test]
    fn builtins_register_and_dispatch() {
        let mut registry = FunctionRegistry::new();
        register_builtins(&mut registry);
        let mut names = registry.names();
        names.sort_unstable();
        assert_eq!(
            names,
            vec!["change_role", "get_date", "get_time", "handle_exit_intent"]
        );

        match registry
            .invoke("get_time", "{}", &ToolContext::default())
            .expect("get_time")
        {
            ToolAction::RequeryLlm(time) => assert_eq!(time.len(), 5),
            other => panic!("unexpected action: {other:?}"),
        }

        match registry
            .invoke(
                "handle_exit_intent",
                r#"{"say_goodbye":"bye"}"#,
                &ToolContext::default(),
            )
            .expect("exit")
        {
            ToolAction::Exit { farewell } => assert_eq!(farewell, "bye"),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn change_role_requires_the_device_owner() {
        let mut registry = FunctionRegistry::new();
        register_builtins(&mut registry);

        // A guest (or unidentified) speaker gets a spoken refusal, never a
        // role switch.
        match registry
            .invoke("change_role", r#"{"role":"Pirate"}"#, &ToolContext::default())
            .expect("guest invoke")
        {
            ToolAction::Respond(text) => assert!(text.contains("owner")),
            other => panic!("unexpected action: {other:?}"),
        }

        match registry
            .invoke("change_role", r#"{"role":"Pirate"}"#, &owner())
            .expect("owner invoke")
        {
            ToolAction::SwitchRole { role } => assert_eq!(role, "Pirate"),
            other => panic!("unexpected action: {other:?}"),
        }
    }
}
