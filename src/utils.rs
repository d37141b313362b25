use crate::peer::types::{IceServer, ServerConfig};
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    // Если url уже начинается с "turn:", "turns:" или "stun:", возвращаем как есть
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        // В зависимости от типа сервера добавляем нужную схему
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Серверы из настроек → формат peer connection
pub fn to_ice_servers(servers: &[ServerConfig]) -> Vec<IceServer> {
    servers
        .iter()
        .map(|config| IceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone(),
            credential: config.credential.clone(),
        })
        .collect()
}
