//! Built-in workflows.

use serde_json::{json, Value};

use super::{ForgeError, Workflow};

pub const NAMES: [&str; 3] = ["heal_app", "full_smoke", "safe_reboot"];

fn raw(name: &str) -> Option<Value> {
    let preset = match name {
        "heal_app" => json!({
            "name": "App heal",
            "steps": [
                { "type": "request", "method": "GET", "url": "/api/healthz", "expectStatus": 200, "label": "Healthcheck 1" },
                { "type": "process_action", "target": "app", "action": "restart", "label": "Restart app" },
                { "type": "delay", "ms": 7000, "label": "Wait 7s" },
                { "type": "request", "method": "GET", "url": "/api/healthz", "expectStatus": 200, "label": "Healthcheck 2" },
                { "type": "request", "method": "GET", "url": "/api/app-meta", "expectStatus": 200, "label": "Check app meta" },
            ],
        }),
        "full_smoke" => json!({
            "name": "System smoke test",
            "steps": [
                { "type": "request", "method": "GET", "url": "/api/info", "expectStatus": 200, "label": "Info API" },
                { "type": "request", "method": "GET", "url": "/api/process/bot/status", "expectStatus": 200, "label": "Bot status" },
                { "type": "request", "method": "GET", "url": "/api/process/app/status", "expectStatus": 200, "label": "App status" },
                { "type": "request", "method": "GET", "url": "/api/app-meta", "expectStatus": 200, "label": "App meta" },
                { "type": "request", "method": "GET", "url": "/downloads/latest.apk", "expectStatus": 200, "label": "APK download" },
            ],
        }),
        "safe_reboot" => json!({
            "name": "Safe restart",
            "steps": [
                { "type": "process_action", "target": "bot", "action": "restart", "label": "Restart bot" },
                { "type": "process_action", "target": "app", "action": "restart", "label": "Restart app" },
                { "type": "delay", "ms": 5000, "label": "Wait 5s" },
                { "type": "request", "method": "GET", "url": "/api/process/bot/status", "expectStatus": 200, "label": "Check bot" },
                { "type": "request", "method": "GET", "url": "/api/process/app/status", "expectStatus": 200, "label": "Check app" },
                { "type": "request", "method": "GET", "url": "/api/healthz", "expectStatus": 200, "label": "Healthcheck" },
            ],
        }),
        _ => return None,
    };
    Some(preset)
}

pub fn get(name: &str) -> Option<Result<Workflow, ForgeError>> {
    raw(name).map(|v| Workflow::from_value(&v))
}

pub fn all() -> Vec<(&'static str, Workflow)> {
    NAMES
        .iter()
        .filter_map(|name| match get(name) {
            Some(Ok(wf)) => Some((*name, wf)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::StepKind;

    #[test]
    fn test_presets_parse() {
        let presets = all();
        assert_eq!(presets.len(), 3);
        for (_, wf) in &presets {
            assert!(wf.steps.iter().all(|s| !matches!(s.kind, StepKind::Unknown(_))));
        }
        assert!(get("nope").is_none());
    }

    #[test]
    fn test_heal_app_shape() {
        let wf = get("heal_app").unwrap().unwrap();
        assert_eq!(wf.steps.len(), 5);
        assert_eq!(wf.steps[1].label, "Restart app");
        assert!(matches!(&wf.steps[2].kind, StepKind::Delay(d) if d.ms == Some(7000)));
    }
}
