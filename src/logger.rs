use crate::peer::types::IceCandidate;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;

/// Подключает tracing-subscriber; `RUST_LOG` переопределяет фильтр
pub fn init() {
    // Проверяем конфигурацию логирования
    if !crate::config::LOGGING_ENABLED || !crate::config::dev::ENABLE_LOGGING {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,yapspace=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} type={:?} family={:?} protocol={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index,
        cand.candidate_type(),
        cand.address_family(),
        cand.protocol
    );
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

/// Количество кандидатов по типам
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateCensus {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateCensus {
    let mut census = CandidateCensus::default();

    for candidate in candidates {
        match candidate.candidate_type() {
            Some("host") => census.host += 1,
            Some("srflx") | Some("prflx") => census.srflx += 1,
            Some("relay") => census.relay += 1,
            _ => {}
        }
    }

    debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        census.host, census.srflx, census.relay
    );

    if census.relay == 0 && !candidates.is_empty() {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
    census
}
