// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;
use url::Url;

use crate::error::{ApiError, Error};

const API_PREFIX: [&str; 3] = ["pd", "api", "v1"];
const KV_PREFIX: [&str; 2] = ["v3", "kv"];

/// Where binlog pumps register themselves.
const PUMP_REGISTRY: &str = "/tidb-binlog/v1/pumps/";

/// A member of the placement driver's raft group.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    #[serde(default)]
    pub member_id: u64,
    #[serde(default)]
    pub peer_urls: Vec<String>,
    #[serde(default)]
    pub client_urls: Vec<String>,
}

/// The response to `GET /pd/api/v1/members`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct MembersInfo {
    #[serde(default)]
    pub members: Vec<Member>,
    /// The member currently serving as leader, if an election has finished.
    pub leader: Option<Member>,
}

/// One entry of the response to `GET /pd/api/v1/health`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub name: String,
    #[serde(default)]
    pub member_id: u64,
    pub health: bool,
}

/// A binlog pump as recorded in the registry.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct PumpNode {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(default)]
    pub host: String,
    /// One of `online`, `pausing`, `paused`, `closing` or `offline`.
    pub state: String,
}

impl PumpNode {
    pub fn is_online(&self) -> bool {
        self.state == "online"
    }
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    range_end: String,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

/// Keys and values are base64 encoded by the gateway.
#[derive(Deserialize)]
struct KeyValue {
    #[serde(default)]
    value: String,
}

/// The smallest key greater than every key starting with `prefix`.
fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if let Some(next) = last.checked_add(1) {
            end.push(next);
            return end;
        }
    }
    // Every byte was 0xff: the range runs to the end of the key space.
    vec![0]
}

fn decode_pump(value: &str) -> Result<PumpNode, Error> {
    let raw = STANDARD.decode(value)?;
    Ok(serde_json::from_slice(&raw)?)
}

#[derive(Clone, Debug)]
pub struct Client {
    inner: reqwest::Client,
    endpoint: Url,
}

impl Client {
    pub(crate) fn new(inner: reqwest::Client, endpoint: Url) -> Client {
        Client { inner, endpoint }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, segments: &[&str]) -> Result<Url, Error> {
        self.url_under(&API_PREFIX, segments)
    }

    fn url_under(&self, prefix: &[&str], segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| Error::CannotBeABase(self.endpoint.clone()))?
            .pop_if_empty()
            .extend(prefix.iter().chain(segments));
        Ok(url)
    }

    fn build_request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, Error> {
        let url = self.url(segments)?;
        trace!(%method, %url, "pd request");
        Ok(self.inner.request(method, url))
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response, Error> {
        let res = req.send().await?;
        let status_code = res.status();
        if status_code.is_success() {
            Ok(res)
        } else {
            let message = res.text().await.unwrap_or_default();
            Err(ApiError {
                status_code,
                message,
            }
            .into())
        }
    }

    async fn send_request<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, Error> {
        Ok(self.send(req).await?.json().await?)
    }

    /// Lists the members of the raft group and the current leader.
    pub async fn members(&self) -> Result<MembersInfo, Error> {
        let req = self.build_request(Method::GET, &["members"])?;
        self.send_request(req).await
    }

    /// Reports whether each member is serving.
    pub async fn health(&self) -> Result<Vec<HealthStatus>, Error> {
        let req = self.build_request(Method::GET, &["health"])?;
        self.send_request(req).await
    }

    /// Asks the current leader to hand leadership to the member named
    /// `name`. The call returns once the request is accepted, not once the
    /// election completes.
    pub async fn transfer_leader(&self, name: &str) -> Result<(), Error> {
        let req = self.build_request(Method::POST, &["leader", "transfer", name])?;
        self.send(req).await?;
        Ok(())
    }

    /// Lists the binlog pumps registered with the cluster and the state each
    /// last reported.
    pub async fn pump_nodes(&self) -> Result<Vec<PumpNode>, Error> {
        let url = self.url_under(&KV_PREFIX, &["range"])?;
        trace!(%url, "pd registry request");
        let req = self.inner.post(url).json(&RangeRequest {
            key: STANDARD.encode(PUMP_REGISTRY),
            range_end: STANDARD.encode(prefix_range_end(PUMP_REGISTRY)),
        });
        let res: RangeResponse = self.send_request(req).await?;
        res.kvs.iter().map(|kv| decode_pump(&kv.value)).collect()
    }

    /// Removes the member named `name` from the raft group.
    pub async fn delete_member(&self, name: &str) -> Result<(), Error> {
        let req = self.build_request(Method::DELETE, &["members", "name", name])?;
        self.send(req).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientBuilder, ClientConfig};

    fn client(endpoint: &str) -> Client {
        ClientBuilder::default()
            .build(ClientConfig {
                endpoint: endpoint.parse().unwrap(),
            })
            .unwrap()
    }

    #[test]
    fn request_urls() {
        let client = client("http://basic-pd.db:2379");
        assert_eq!(
            client.url(&["members"]).unwrap().as_str(),
            "http://basic-pd.db:2379/pd/api/v1/members"
        );
        assert_eq!(
            client
                .url(&["leader", "transfer", "basic-pd-2"])
                .unwrap()
                .as_str(),
            "http://basic-pd.db:2379/pd/api/v1/leader/transfer/basic-pd-2"
        );

        // Names are single path segments, whatever they contain.
        assert_eq!(
            client
                .url(&["members", "name", "a/b"])
                .unwrap()
                .as_str(),
            "http://basic-pd.db:2379/pd/api/v1/members/name/a%2Fb"
        );

        let client = self::client("mailto:pd@example.com");
        assert!(matches!(
            client.url(&["members"]),
            Err(Error::CannotBeABase(_))
        ));
    }

    #[test]
    fn decodes_members() {
        let raw = r#"{
            "header": {"cluster_id": 7032541380935127515},
            "members": [
                {
                    "name": "basic-pd-0",
                    "member_id": 1,
                    "peer_urls": ["http://basic-pd-0.basic-pd-peer.db.svc:2380"],
                    "client_urls": ["http://basic-pd-0.basic-pd-peer.db.svc:2379"],
                    "binary_version": "v8.1.0"
                },
                {"name": "basic-pd-1", "member_id": 2}
            ],
            "leader": {"name": "basic-pd-1", "member_id": 2},
            "etcd_leader": {"name": "basic-pd-1", "member_id": 2}
        }"#;
        let info: MembersInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.members.len(), 2);
        assert_eq!(info.members[0].client_urls.len(), 1);
        assert_eq!(info.leader.unwrap().name, "basic-pd-1");

        // A cluster mid-election has no leader.
        let info: MembersInfo = serde_json::from_str(r#"{"members": []}"#).unwrap();
        assert_eq!(info.leader, None);
    }

    #[test]
    fn decodes_health() {
        let raw = r#"[
            {"name": "basic-pd-0", "member_id": 1, "client_urls": [], "health": true},
            {"name": "basic-pd-1", "member_id": 2, "client_urls": [], "health": false}
        ]"#;
        let health: Vec<HealthStatus> = serde_json::from_str(raw).unwrap();
        assert_eq!(
            health
                .iter()
                .map(|member| (member.name.as_str(), member.health))
                .collect::<Vec<_>>(),
            vec![("basic-pd-0", true), ("basic-pd-1", false)]
        );
    }

    #[test]
    fn registry_range() {
        let client = client("http://basic-pd.db:2379");
        assert_eq!(
            client.url_under(&KV_PREFIX, &["range"]).unwrap().as_str(),
            "http://basic-pd.db:2379/v3/kv/range"
        );
        assert_eq!(prefix_range_end(PUMP_REGISTRY), b"/tidb-binlog/v1/pumps0");
        assert_eq!(prefix_range_end("a\u{7f}"), b"a\x80");
        assert_eq!(prefix_range_end(""), vec![0]);
    }

    #[test]
    fn decodes_pump_nodes() {
        let value = STANDARD.encode(
            r#"{"nodeId":"basic-pump-0:8250","host":"basic-pump-0.basic-pump-peer.db.svc:8250","state":"online","isAlive":false,"score":0,"label":null,"maxCommitTS":449191617138180097,"updateTS":449191619693035521}"#,
        );
        let raw = format!(
            r#"{{"header": {{"revision": "12"}}, "kvs": [{{"key": "L3RpZGItYmlubG9nL3YxL3B1bXBzL2Jhc2ljLXB1bXAtMDo4MjUw", "value": "{value}"}}], "count": "1"}}"#
        );
        let res: RangeResponse = serde_json::from_str(&raw).unwrap();
        let nodes = res
            .kvs
            .iter()
            .map(|kv| decode_pump(&kv.value))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(
            nodes,
            vec![PumpNode {
                node_id: "basic-pump-0:8250".into(),
                host: "basic-pump-0.basic-pump-peer.db.svc:8250".into(),
                state: "online".into(),
            }]
        );
        assert!(nodes[0].is_online());

        // An empty registry has no `kvs` at all.
        let res: RangeResponse = serde_json::from_str(r#"{"header": {}}"#).unwrap();
        assert!(res.kvs.is_empty());

        assert!(matches!(decode_pump("not base64!"), Err(Error::Base64(_))));
        assert!(matches!(
            decode_pump(&STANDARD.encode("{}")),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn api_errors_carry_the_reason() {
        let err = Error::from(ApiError {
            status_code: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            message: "\"no leader\"\n".into(),
        });
        assert_eq!(
            err.to_string(),
            "pd error: api: \"no leader\" (status 500 Internal Server Error)"
        );
    }
}
