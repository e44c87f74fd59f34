/// Field keys of the `chatlink.connect` span.
/// Keep these stable; changing them is a breaking change for dashboards.
pub const KEY_ENDPOINT: &str = "conn.endpoint";
pub const KEY_CONNECTOR: &str = "conn.connector";
pub const KEY_ATTEMPT: &str = "conn.attempt";
pub const KEY_OUTCOME: &str = "conn.outcome";
