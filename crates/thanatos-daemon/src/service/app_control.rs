//! `AppControl` service: per-package policy and launch rules.

use std::sync::Arc;

use tracing::debug;

use crate::engine::DecisionEngine;
use crate::protocol::messages::{AppPolicyConfig, Empty, LaunchRule};

/// App-policy control. Both calls forward to the engine unchanged.
pub struct AppControlService {
    engine: Arc<dyn DecisionEngine>,
}

impl AppControlService {
    /// Creates the service.
    #[must_use]
    pub fn new(engine: Arc<dyn DecisionEngine>) -> Self {
        Self { engine }
    }

    /// `SetAppConfig`: replaces the package's whole configuration.
    pub fn set_app_config(&self, config: AppPolicyConfig) -> Empty {
        debug!(package = %config.package_name, "SetAppConfig");
        self.engine.set_app_config(config);
        Empty {}
    }

    /// `SetLaunchRule`: records a (source, target) permission.
    pub fn set_launch_rule(&self, rule: LaunchRule) -> Empty {
        debug!(
            source = %rule.source_package,
            target = %rule.target_package,
            allowed = rule.allowed,
            "SetLaunchRule"
        );
        self.engine.set_launch_rule(rule);
        Empty {}
    }
}
