use std::path::Path;

use lineloop_core::config::LoopConfig;
use serde_json::json;

pub struct HealthCheck {
    pub checks: Vec<(&'static str, bool)>,
}

impl HealthCheck {
    pub fn healthy(&self) -> bool {
        self.checks.iter().all(|(_, ok)| *ok)
    }
}

fn on_path(bin: &Path) -> bool {
    if bin.components().count() > 1 {
        return bin.is_file();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(bin).is_file())
}

/// Verify the environment before any work is attempted.
pub fn check(config: &LoopConfig) -> HealthCheck {
    HealthCheck {
        checks: vec![
            ("assistant_cli", on_path(&config.assistant_bin)),
            ("tracker_cli", on_path(&config.tracker_bin)),
            ("git_repo", config.cwd.join(".git").exists()),
            ("beads_init", config.cwd.join(".beads").exists()),
        ],
    }
}

pub fn print(health: &HealthCheck, json: bool) {
    if json {
        let checks: serde_json::Map<String, serde_json::Value> = health
            .checks
            .iter()
            .map(|(name, ok)| (name.to_string(), json!(ok)))
            .collect();
        let report = json!({"healthy": health.healthy(), "checks": checks});
        println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        return;
    }
    println!("Environment Health Check");
    println!("{}", "=".repeat(30));
    for (name, ok) in &health.checks {
        println!("  {name}: {}", if *ok { "OK" } else { "FAIL" });
    }
    println!("{}", "=".repeat(30));
    println!(
        "Overall: {}",
        if health.healthy() { "HEALTHY" } else { "UNHEALTHY" }
    );
}
