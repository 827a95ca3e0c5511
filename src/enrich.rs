//! Match enrichment via the FACEIT match API
//!
//! Looks up the players of a match so runs can show nicknames, ratings and
//! sides next to each speaker's audio. Purely cosmetic: a failed lookup never
//! affects a run's status.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const FACEIT_API_BASE: &str = "https://www.faceit.com/api";

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("Match not found: {0}")]
    NotFound(String),
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
}

/// One player as listed by the match service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    /// Same id space as the recording's speaker ids.
    pub speaker_id: String,
    pub nickname: String,
    pub elo: Option<u32>,
    pub level: Option<u32>,
    pub team: String,
}

/// Source of player identities for a match
#[async_trait]
pub trait MatchEnricher: Send + Sync {
    async fn roster(&self, match_id: &str) -> Result<Vec<RosterEntry>, EnrichError>;
}

#[derive(Debug, Deserialize)]
struct MatchResponse {
    payload: Option<MatchPayload>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchPayload {
    entity_custom: Option<EntityCustom>,
}

#[derive(Debug, Deserialize)]
struct EntityCustom {
    teams: Teams,
}

#[derive(Debug, Deserialize)]
struct Teams {
    faction1: Option<Faction>,
    faction2: Option<Faction>,
}

#[derive(Debug, Deserialize)]
struct Faction {
    #[serde(default)]
    roster: Vec<RosterPlayer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RosterPlayer {
    #[serde(default)]
    game_id: String,
    #[serde(default)]
    nickname: String,
    elo: Option<u32>,
    game_skill_level: Option<u32>,
}

/// Flatten a match response into roster entries, faction 1 first.
fn roster_from_response(response: MatchResponse) -> Vec<RosterEntry> {
    let Some(teams) = response
        .payload
        .and_then(|p| p.entity_custom)
        .map(|e| e.teams)
    else {
        return Vec::new();
    };

    [(teams.faction1, "Team 1"), (teams.faction2, "Team 2")]
        .into_iter()
        .filter_map(|(faction, team)| faction.map(|f| (f, team)))
        .flat_map(|(faction, team)| {
            faction
                .roster
                .into_iter()
                .filter(|p| !p.game_id.is_empty())
                .map(move |p| RosterEntry {
                    speaker_id: p.game_id,
                    nickname: p.nickname,
                    elo: p.elo,
                    level: p.game_skill_level,
                    team: team.to_string(),
                })
        })
        .collect()
}

/// FACEIT match API client
pub struct FaceitClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl FaceitClient {
    /// Create a client; the key is optional for public match data
    pub fn new(api_key: Option<String>) -> Result<Self, EnrichError> {
        Self::with_base_url(api_key, FACEIT_API_BASE)
    }

    pub fn with_base_url(api_key: Option<String>, base_url: &str) -> Result<Self, EnrichError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            api_key: api_key.filter(|k| !k.is_empty()),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MatchEnricher for FaceitClient {
    async fn roster(&self, match_id: &str) -> Result<Vec<RosterEntry>, EnrichError> {
        let url = format!("{}/match/v2/match/{}", self.base_url, match_id);
        debug!("Fetching match data: {}", url);

        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::NOT_FOUND => EnrichError::NotFound(match_id.to_string()),
                StatusCode::TOO_MANY_REQUESTS => EnrichError::RateLimitExceeded,
                _ => {
                    warn!("Match API error for {}: {} - {}", match_id, status, text);
                    EnrichError::Api(format!("Match lookup failed: {}", status))
                }
            });
        }

        let body: MatchResponse = response.json().await?;
        if body.payload.is_none() {
            let message = body.message.unwrap_or_else(|| "empty payload".to_string());
            return Err(EnrichError::Api(message));
        }

        let roster = roster_from_response(body);
        debug!("Match {} has {} listed players", match_id, roster.len());
        Ok(roster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const MATCH_JSON: &str = r#"{
        "code": "OPERATION-OK",
        "payload": {
            "id": "1-abc",
            "entityCustom": {
                "teams": {
                    "faction1": {"name": "team_a", "roster": [
                        {"gameId": "76561198000000001", "nickname": "alice", "elo": 2100, "gameSkillLevel": 10},
                        {"gameId": "", "nickname": "ghost"}
                    ]},
                    "faction2": {"name": "team_b", "roster": [
                        {"gameId": "76561198000000002", "nickname": "bob", "elo": 1500, "gameSkillLevel": 7}
                    ]}
                }
            }
        }
    }"#;

    /// Serve one canned HTTP response and hand back the request head.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (base, handle)
    }

    #[test]
    fn test_roster_parsing() {
        let response: MatchResponse = serde_json::from_str(MATCH_JSON).unwrap();
        let roster = roster_from_response(response);
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].nickname, "alice");
        assert_eq!(roster[0].team, "Team 1");
        assert_eq!(roster[0].elo, Some(2100));
        assert_eq!(roster[1].speaker_id, "76561198000000002");
        assert_eq!(roster[1].team, "Team 2");
        assert_eq!(roster[1].level, Some(7));
    }

    #[test]
    fn test_missing_teams_yield_empty_roster() {
        let response: MatchResponse = serde_json::from_str(r#"{"payload": {"id": "x"}}"#).unwrap();
        assert!(roster_from_response(response).is_empty());
    }

    #[tokio::test]
    async fn test_client_fetches_roster_with_key() {
        let (base, server) = serve_once("200 OK", MATCH_JSON).await;
        let client = FaceitClient::with_base_url(Some("secret".to_string()), &base).unwrap();

        let roster = client.roster("1-abc").await.unwrap();
        assert_eq!(roster.len(), 2);

        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("get /match/v2/match/1-abc "));
        assert!(request.contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_client_maps_http_errors() {
        let (base, _server) = serve_once("404 Not Found", "{}").await;
        let client = FaceitClient::with_base_url(None, &base).unwrap();
        assert!(matches!(client.roster("1-x").await, Err(EnrichError::NotFound(_))));

        let (base, _server) = serve_once("429 Too Many Requests", "{}").await;
        let client = FaceitClient::with_base_url(None, &base).unwrap();
        assert!(matches!(client.roster("1-x").await, Err(EnrichError::RateLimitExceeded)));
    }
}
