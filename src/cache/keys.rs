use std::time::Duration;

pub const AMAS_STATE_TTL: Duration = Duration::from_secs(30 * 60);
pub const AMAS_MODEL_TTL: Duration = Duration::from_secs(60 * 60);

pub fn amas_state_key(user_id: &str) -> String {
    format!("amas:state:{}", user_id)
}

pub fn amas_model_key(user_id: &str) -> String {
    format!("amas:model:{}", user_id)
}

pub fn amas_version_key(data_key: &str) -> String {
    format!("{}:version", data_key)
}

pub fn amas_lock_key(data_key: &str) -> String {
    format!("lock:{}", data_key)
}

pub fn amas_user_prefix() -> &'static str {
    "amas:"
}
