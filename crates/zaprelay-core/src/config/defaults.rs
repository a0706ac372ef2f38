//! Serde default functions for config fields.

pub(super) fn default_name() -> String {
    "zaprelay".to_string()
}
pub(super) fn default_data_dir() -> String {
    "~/.zaprelay".to_string()
}
pub(super) fn default_log_level() -> String {
    "info".to_string()
}
pub(super) fn default_true() -> bool {
    true
}
pub(super) fn default_api_host() -> String {
    "0.0.0.0".to_string()
}
pub(super) fn default_api_port() -> u16 {
    8080
}
pub(super) fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}
pub(super) fn default_db_path() -> String {
    "~/.zaprelay/data/relay.db".to_string()
}
pub(super) fn default_batch_size() -> usize {
    10
}
pub(super) fn default_max_attempts() -> u32 {
    3
}
pub(super) fn default_claim_lease_secs() -> u64 {
    300
}
pub(super) fn default_max_nodes() -> usize {
    20
}
pub(super) fn default_max_delay_secs() -> u64 {
    10
}
pub(super) fn default_anti_loop_secs() -> i64 {
    5
}
pub(super) fn default_history_messages() -> usize {
    10
}
pub(super) fn default_handoff_message() -> String {
    "Um momento, vou transferir você para um de nossos atendentes.".to_string()
}
pub(super) fn default_intents() -> Vec<String> {
    [
        "agendamento",
        "suporte",
        "vendas",
        "informacao",
        "saudacao",
        "cancelamento",
        "outro",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
pub(super) fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}
pub(super) fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
pub(super) fn default_system_prompt() -> String {
    "Você é um assistente de atendimento via WhatsApp. Responda de forma breve, \
     cordial e objetiva, no idioma do cliente. Se não souber a resposta, diga que \
     um atendente humano poderá ajudar."
        .to_string()
}
pub(super) fn default_whisper_model() -> String {
    "whisper-1".to_string()
}
pub(super) fn default_token_url() -> String {
    "https://oauth.bitrix.info/oauth/token/".to_string()
}
pub(super) fn default_refresh_buffer_secs() -> i64 {
    600
}
pub(super) fn default_connector_id() -> String {
    "zaprelay_whatsapp".to_string()
}
pub(super) fn default_connector_name() -> String {
    "WhatsApp (zaprelay)".to_string()
}
pub(super) fn default_request_timeout_secs() -> u64 {
    30
}
