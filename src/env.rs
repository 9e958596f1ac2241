//! Environment resolution for spawned project commands.

use std::collections::HashMap;

/// Builds the full environment for a project's child processes.
///
/// Layering, later entries winning: the supervisor's own environment, then
/// the port variable derived from the project's configured port, then the
/// project's extra variables. The result is the entire environment the child
/// sees; the runner does not inherit anything implicitly.
pub fn resolve(
    base: impl IntoIterator<Item = (String, String)>,
    port: u16,
    port_var: &str,
    extra: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = base.into_iter().collect();
    env.insert(port_var.to_string(), port.to_string());
    for (key, value) in extra {
        env.insert(key.clone(), value.clone());
    }
    env
}
