/// Label stored for sessions whose client could not be identified.
pub const UNKNOWN_DEVICE: &str = "Unknown Device";
/// Address stored when the client IP is not available.
pub const UNKNOWN_IP: &str = "Unknown IP";

const PLACEHOLDER_TOKENS: &[&str] = &["mock-token-1", "mock-token-2", "mock-token-3"];
const MIN_DEVICE_TOKEN_LEN: usize = 50;

/// Maps a `User-Agent` header to a coarse device label.
///
/// Checks run in order, so a mobile Windows agent is reported as a mobile device.
pub fn device_label(user_agent: Option<&str>) -> &'static str {
    let Some(agent) = user_agent else {
        return UNKNOWN_DEVICE;
    };
    const RULES: &[(&str, &str)] = &[
        ("Mobile", "Mobile Device"),
        ("Tablet", "Tablet"),
        ("Windows", "Windows PC"),
        ("Mac", "Mac"),
        ("Linux", "Linux PC"),
    ];
    RULES
        .iter()
        .find(|(needle, _)| agent.contains(needle))
        .map(|(_, label)| *label)
        .unwrap_or(UNKNOWN_DEVICE)
}

/// Returns `true` when a registered push token looks like a real FCM registration.
pub fn is_deliverable_device_token(token: &str) -> bool {
    let token = token.trim();
    !token.is_empty()
        && !PLACEHOLDER_TOKENS.contains(&token)
        && token.len() > MIN_DEVICE_TOKEN_LEN
}
