use serde::{Deserialize, Serialize};
use std::fmt;

/// Тип SDP-сообщения
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Описание сессии в том виде, в каком оно лежит в записи звонка: `{type, sdp}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE кандидат для WebRTC соединения
///
/// `candidate`/`sdp_mid`/`sdp_mline_index` нужны, чтобы применить кандидат;
/// остальное - разобранные метаданные для логов.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foundation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_port: Option<u16>,
}

impl IceCandidate {
    /// Тип кандидата: из метаданных, иначе из строки `... typ host ...`
    pub fn candidate_type(&self) -> Option<&str> {
        if let Some(typ) = self.typ.as_deref() {
            return Some(typ);
        }
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return parts.next();
            }
        }
        None
    }

    /// IPv4 / IPv6 по адресу кандидата
    pub fn address_family(&self) -> Option<&'static str> {
        let address = self.address.as_deref()?;
        match address.parse::<std::net::IpAddr>() {
            Ok(std::net::IpAddr::V4(_)) => Some("ipv4"),
            Ok(std::net::IpAddr::V6(_)) => Some("ipv6"),
            // mDNS имена (*.local) не раскрываем
            Err(_) => None,
        }
    }
}

/// Конфигурация ICE сервера в формате настроек
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// `urls` у провайдера бывает и строкой, и списком
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            IceUrls::One(url) => vec![url],
            IceUrls::Many(urls) => urls,
        }
    }
}

/// Один relay/reflection сервер, готовый к передаче в peer connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportPolicy {
    #[default]
    All,
    Relay,
}

/// Набор серверов на одну попытку соединения
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
    pub pool_size: u8,
    pub policy: TransportPolicy,
}

/// Роль в звонке, фиксируется матчмейкером
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Offerer => Role::Answerer,
            Role::Answerer => Role::Offerer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => f.write_str("offerer"),
            Role::Answerer => f.write_str("answerer"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Состояние соединения/сетевого пути в одном словаре
///
/// Порядок вариантов - по "тяжести": при комбинировании двух источников
/// побеждает более тяжёлое состояние.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkState {
    New,
    Connected,
    Connecting,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// Совмещённое состояние peer connection и ICE транспорта
    pub fn combine(self, other: LinkState) -> LinkState {
        self.max(other)
    }
}
