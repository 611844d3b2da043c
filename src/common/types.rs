use serde::{Deserialize, Serialize};

/// What the registry hands back after a session is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewClientResult {
    pub id: String,
    /// Port the client's links dial. Internal to the relay.
    pub port: u16,
    pub max_conn_count: usize,
}

/// Body of `POST /api/tunnels[/{id}]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewClientResponse {
    pub id: String,
    pub port: u16,
    #[serde(default)]
    pub max_conn_count: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    /// Address links should dial instead of the API host, when the relay
    /// sits behind a different front door.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl NewClientResponse {
    pub fn from_result(result: NewClientResult, url: String) -> Self {
        Self {
            id: result.id,
            port: result.port,
            max_conn_count: Some(result.max_conn_count),
            url: Some(url),
            ip: None,
        }
    }
}

/// Body of `GET /api/tunnels/{id}/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub connected_sockets: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_uses_camel_case_on_the_wire() {
        let result = NewClientResult {
            id: "brave-otter-12".into(),
            port: 40123,
            max_conn_count: 10,
        };
        let body = NewClientResponse::from_result(result, "http://brave-otter-12.example.com".into());
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["maxConnCount"], 10);
        assert_eq!(json["url"], "http://brave-otter-12.example.com");
        assert!(json.get("ip").is_none());
    }

    #[test]
    fn missing_optional_fields_deserialize() {
        let body: NewClientResponse = serde_json::from_str(r#"{"id":"abcd","port":1}"#).unwrap();
        assert_eq!(body.max_conn_count, None);
        assert_eq!(body.url, None);
    }
}
