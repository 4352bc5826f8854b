use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::config::{Device, HttpPolicy};
use crate::inventory::{Inventory, PointGroup, PointLibrary};
use crate::rpc::{Method, RequestId, RpcRequest};
use crate::transport::{Transport, Verb, is_failure};

/// Largest number of points requested in a single call
pub const POINTS_PER_REQUEST: usize = 50;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("no session id in {0} response")]
    NoSession(Method),

    #[error("no application list in {0} response")]
    NoInventory(Method),

    #[error("{0} could not be completed")]
    RequestFailed(Method),

    #[error("failed to encode request: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct Session {
    sid: String,
    next_id: RequestId,
}

/// Point-in-time view of a controller for status reporting
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ControllerSummary {
    pub name: String,
    pub address: String,
    pub groups: Vec<String>,
    pub has_session: bool,
}

/// Client for one controller
///
/// The client is shared between the polling tasks, all methods take
/// `&self`. Session state sits behind a mutex that is only held while
/// request URLs are built, never across network calls.
#[derive(Debug)]
pub struct Controller {
    name: String,
    poll_interval: Duration,
    transport: Transport,
    library: Arc<PointLibrary>,
    session: Mutex<Session>,
    inventory: RwLock<Arc<Inventory>>,
}

impl Controller {
    pub fn new(
        device: Device,
        poll_interval: Duration,
        policy: HttpPolicy,
        library: Arc<PointLibrary>,
    ) -> Self {
        Self {
            name: device.name,
            poll_interval,
            transport: Transport::new(device.address, policy),
            library,
            session: Mutex::new(Session::default()),
            inventory: RwLock::new(Arc::new(Inventory::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        self.transport.address()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn request_delay(&self) -> Duration {
        self.transport.policy().request_delay
    }

    pub async fn session_id(&self) -> String {
        self.session.lock().await.sid.clone()
    }

    /// Current inventory, unaffected by later refreshes
    pub async fn inventory(&self) -> Arc<Inventory> {
        self.inventory.read().await.clone()
    }

    pub async fn summary(&self) -> ControllerSummary {
        let inventory = self.inventory().await;
        ControllerSummary {
            name: self.name.clone(),
            address: self.address().to_owned(),
            groups: inventory
                .groups()
                .iter()
                .map(|g| g.appname.clone())
                .collect(),
            has_session: !self.session_id().await.is_empty(),
        }
    }

    /// Obtain a new session id
    ///
    /// On failure the previous session id is kept.
    #[instrument(skip_all, fields(controller = %self.name), err)]
    pub async fn refresh_session(&self) -> Result<String, ControllerError> {
        let url = {
            let mut session = self.session.lock().await;
            RpcRequest::new(Method::GetSessionId, None, session.next_id.take())
                .to_url(&self.transport.endpoint())?
        };

        let responses = self
            .transport
            .execute(Verb::Get, Method::GetSessionId, vec![url])
            .await;

        let sid = responses
            .first()
            .and_then(|r| r.pointer("/result/sid"))
            .and_then(Value::as_str)
            .ok_or(ControllerError::NoSession(Method::GetSessionId))?
            .to_owned();

        debug!("got new session id");
        self.session.lock().await.sid = sid.clone();
        Ok(sid)
    }

    /// Keep the controller session alive
    #[instrument(skip_all, fields(controller = %self.name), err)]
    pub async fn touch_session(&self) -> Result<(), ControllerError> {
        let responses = self.call(Method::TouchSession, session_params).await?;
        if responses.iter().any(is_failure) {
            return Err(ControllerError::RequestFailed(Method::TouchSession));
        }
        Ok(())
    }

    /// Raw `GetSystemInventory` responses
    pub async fn fetch_inventory(&self) -> Result<Vec<Value>, ControllerError> {
        self.call(Method::GetSystemInventory, session_params).await
    }

    /// Reload the inventory from the controller, returning the number of
    /// point groups
    ///
    /// The previous inventory stays in place if the controller did not
    /// return an application list.
    #[instrument(skip_all, fields(controller = %self.name), err)]
    pub async fn refresh_inventory(&self) -> Result<usize, ControllerError> {
        let responses = self.fetch_inventory().await?;

        let inventory = responses
            .first()
            .and_then(|r| r.pointer("/result/aps"))
            .and_then(|aps| Inventory::from_applications(aps, &self.library))
            .ok_or(ControllerError::NoInventory(Method::GetSystemInventory))?;

        let groups = inventory.len();
        *self.inventory.write().await = Arc::new(inventory);
        info!(groups, "updated inventory");
        Ok(groups)
    }

    pub async fn fetch_alarms(&self) -> Result<Vec<Value>, ControllerError> {
        self.call(Method::GetAlarms, session_params).await
    }

    /// Read the current value of every point of a group
    ///
    /// Points are requested in pages, each page yields one response.
    #[instrument(skip_all, fields(controller = %self.name, iid = %group.iid), err)]
    pub async fn fetch_point_values(
        &self,
        group: &PointGroup,
    ) -> Result<Vec<Value>, ControllerError> {
        self.call(Method::GetPointValues, |sid| point_pages(sid, group))
            .await
    }

    /// Issue one POST per parameter set produced by `params`
    ///
    /// An empty session id is refreshed first so the parameters carry a
    /// usable one.
    async fn call<F>(&self, method: Method, params: F) -> Result<Vec<Value>, ControllerError>
    where
        F: FnOnce(&str) -> Vec<Value>,
    {
        if self.session_id().await.is_empty() {
            if let Err(e) = self.refresh_session().await {
                warn!("{method} without session: {e}");
            }
        }

        let endpoint = self.transport.endpoint();
        let urls = {
            let mut session = self.session.lock().await;
            let params = params(&session.sid);
            params
                .iter()
                .map(|p| RpcRequest::new(method, Some(p), session.next_id.take()).to_url(&endpoint))
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(self.transport.execute(Verb::Post, method, urls).await)
    }
}

fn session_params(sid: &str) -> Vec<Value> {
    vec![json!({ "sid": sid })]
}

fn point_pages(sid: &str, group: &PointGroup) -> Vec<Value> {
    let pointers: Vec<String> = group.pointers().collect();
    pointers
        .chunks(POINTS_PER_REQUEST)
        .map(|page| {
            let points: Vec<Value> = page.iter().map(|ptr| json!({ "ptr": ptr })).collect();
            json!({ "sid": sid, "points": points })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};
    use tokio::task::JoinSet;

    use super::*;

    const ENDPOINT: &str = "/cgi-bin/mgw.cgi";

    fn test_policy() -> HttpPolicy {
        HttpPolicy {
            retries: 2,
            retry_delay: Duration::from_millis(5),
            timeout: Duration::from_secs(2),
            request_delay: Duration::from_millis(1),
        }
    }

    fn controller(server: &Server, library: PointLibrary) -> Controller {
        Controller::new(
            Device {
                name: "panel_0".into(),
                address: server.host_with_port(),
            },
            Duration::from_secs(180),
            test_policy(),
            Arc::new(library),
        )
    }

    fn call(method: &str, params: Option<Value>, id: u16) -> Matcher {
        let body = match params {
            Some(params) => format!(
                r#"{{"jsonrpc":"2.0","method":"{method}","params":{params},"id":"{id}"}}"#
            ),
            None => format!(r#"{{"jsonrpc":"2.0","method":"{method}","id":"{id}"}}"#),
        };
        Matcher::UrlEncoded("m".into(), body)
    }

    fn group(points: usize) -> PointGroup {
        PointGroup {
            iid: "0001".into(),
            appname: "AHU-1".into(),
            apptype: "AHU".into(),
            points: (0..points).map(|i| format!("P{i}")).collect(),
        }
    }

    /// Id of the JSON-RPC call carried in a request's `m` parameter
    fn request_id(path_and_query: &str) -> u16 {
        let (_, m) = path_and_query.split_once("?m=").unwrap();
        let m = urlencoding::decode(m).unwrap();
        let call: Value = serde_json::from_str(&m).unwrap();
        call["id"].as_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn it_refreshes_the_session_id() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", ENDPOINT)
            .match_query(call("GetSessionID", None, 1))
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","result":{"sid":"s-123"},"id":"1"}"#)
            .create_async()
            .await;

        let controller = controller(&server, PointLibrary::default());
        let sid = controller.refresh_session().await.unwrap();

        assert_eq!(sid, "s-123");
        assert_eq!(controller.session_id().await, "s-123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn it_keeps_the_previous_session_on_failure() {
        let mut server = Server::new_async().await;
        let ok = server
            .mock("GET", ENDPOINT)
            .match_query(call("GetSessionID", None, 1))
            .with_status(200)
            .with_body(r#"{"result":{"sid":"s-123"}}"#)
            .create_async()
            .await;
        let missing = server
            .mock("GET", ENDPOINT)
            .match_query(call("GetSessionID", None, 2))
            .with_status(200)
            .with_body(r#"{"result":{}}"#)
            .create_async()
            .await;

        let controller = controller(&server, PointLibrary::default());
        controller.refresh_session().await.unwrap();
        let res = controller.refresh_session().await;

        assert!(matches!(res, Err(ControllerError::NoSession(_))));
        assert_eq!(controller.session_id().await, "s-123");
        ok.assert_async().await;
        missing.assert_async().await;
    }

    #[tokio::test]
    async fn it_refreshes_the_session_before_posting_without_one() {
        let mut server = Server::new_async().await;
        let session = server
            .mock("GET", ENDPOINT)
            .match_query(call("GetSessionID", None, 1))
            .with_status(200)
            .with_body(r#"{"result":{"sid":"s-9"}}"#)
            .create_async()
            .await;
        let alarms = server
            .mock("POST", ENDPOINT)
            .match_query(call("GetAlarms", Some(json!({ "sid": "s-9" })), 2))
            .with_status(200)
            .with_body(r#"{"result":{"alarms":[]}}"#)
            .create_async()
            .await;

        let controller = controller(&server, PointLibrary::default());
        let responses = controller.fetch_alarms().await.unwrap();

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["result"]["ip"], json!(server.host_with_port()));
        session.assert_async().await;
        alarms.assert_async().await;
    }

    #[tokio::test]
    async fn it_pages_point_requests() {
        let mut server = Server::new_async().await;
        let session = server
            .mock("GET", ENDPOINT)
            .match_query(call("GetSessionID", None, 1))
            .with_status(200)
            .with_body(r#"{"result":{"sid":"s-1"}}"#)
            .create_async()
            .await;

        let group = group(120);
        let pointers: Vec<String> = group.pointers().collect();
        let mut pages = Vec::new();
        for (n, chunk) in pointers.chunks(50).enumerate() {
            let points: Vec<Value> = chunk.iter().map(|p| json!({ "ptr": p })).collect();
            let params = json!({ "sid": "s-1", "points": points });
            let page = server
                .mock("POST", ENDPOINT)
                .match_query(call("GetPointValues", Some(params), n as u16 + 2))
                .with_status(200)
                .with_body(format!(r#"{{"result":{{"page":{n}}}}}"#))
                .expect(1)
                .create_async()
                .await;
            pages.push(page);
        }

        let controller = controller(&server, PointLibrary::default());
        let responses = controller.fetch_point_values(&group).await.unwrap();

        assert_eq!(responses.len(), 3);
        assert_eq!(responses[2]["result"]["page"], json!(2));
        session.assert_async().await;
        for page in pages {
            page.assert_async().await;
        }
    }

    #[tokio::test]
    async fn it_returns_failure_records_for_unreachable_pages() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", ENDPOINT)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"result":{"sid":"s-1"}}"#)
            .create_async()
            .await;
        let points = server
            .mock("POST", ENDPOINT)
            .match_query(Matcher::Any)
            .with_status(502)
            .expect(2 * 2)
            .create_async()
            .await;

        let controller = controller(&server, PointLibrary::default());
        let responses = controller.fetch_point_values(&group(60)).await.unwrap();

        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(is_failure));
        points.assert_async().await;
    }

    #[tokio::test]
    async fn it_replaces_the_inventory_on_refresh() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", ENDPOINT)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"result":{"sid":"s-1"}}"#)
            .create_async()
            .await;
        server
            .mock("POST", ENDPOINT)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({ "result": { "aps": [
                    { "iid": "0001", "appname": "Outdoor", "apptype": "Global Data" },
                    { "iid": "0002", "appname": "Lights", "apptype": "Lighting" }
                ]}})
                .to_string(),
            )
            .create_async()
            .await;

        let controller = controller(&server, PointLibrary::default());
        let before = controller.inventory().await;
        let groups = controller.refresh_inventory().await.unwrap();

        assert_eq!(groups, 1);
        assert!(before.is_empty());
        assert_eq!(controller.inventory().await.groups()[0].appname, "Outdoor");
        assert_eq!(
            controller.summary().await,
            ControllerSummary {
                name: "panel_0".into(),
                address: server.host_with_port(),
                groups: vec!["Outdoor".into()],
                has_session: true,
            }
        );
    }

    #[tokio::test]
    async fn it_keeps_the_inventory_when_refresh_fails() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", ENDPOINT)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"result":{"sid":"s-1"}}"#)
            .create_async()
            .await;
        let good = server
            .mock("POST", ENDPOINT)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"result":{"aps":[{"iid":"0001","appname":"Outdoor","apptype":"Global Data"}]}}"#)
            .expect(1)
            .create_async()
            .await;

        let controller = controller(&server, PointLibrary::default());
        controller.refresh_inventory().await.unwrap();
        good.remove_async().await;

        server
            .mock("POST", ENDPOINT)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"result":{"busy":true}}"#)
            .create_async()
            .await;
        let res = controller.refresh_inventory().await;

        assert!(matches!(res, Err(ControllerError::NoInventory(_))));
        assert_eq!(controller.inventory().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn it_issues_consecutive_request_ids_to_concurrent_calls() {
        let mut server = Server::new_async().await;
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for verb in ["GET", "POST"] {
            let seen = seen.clone();
            server
                .mock(verb, ENDPOINT)
                .match_query(Matcher::Any)
                .with_status(200)
                .with_body_from_request(move |req| {
                    seen.lock().unwrap().push(request_id(req.path_and_query()));
                    br#"{"result":{"sid":"s-1"}}"#.to_vec()
                })
                .create_async()
                .await;
        }

        let controller = Arc::new(controller(&server, PointLibrary::default()));
        controller.refresh_session().await.unwrap();

        let mut calls = JoinSet::new();
        for _ in 0..4 {
            let c = controller.clone();
            calls.spawn(async move { c.refresh_session().await.map(|_| ()) });
            let c = controller.clone();
            calls.spawn(async move { c.touch_session().await });
            let c = controller.clone();
            calls.spawn(async move { c.fetch_point_values(&group(120)).await.map(|_| ()) });
        }
        while let Some(res) = calls.join_next().await {
            res.unwrap().unwrap();
        }

        // one session refresh, four more, four heartbeats and 4 x 3 pages
        let mut ids = seen.lock().unwrap().clone();
        ids.sort_unstable();
        assert_eq!(ids, (1..=21).collect::<Vec<u16>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn it_polls_from_a_stable_inventory_during_refresh() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", ENDPOINT)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"result":{"sid":"s-1"}}"#)
            .create_async()
            .await;
        let two_groups = server
            .mock("POST", ENDPOINT)
            .match_query(Matcher::Regex("GetSystemInventory".into()))
            .with_status(200)
            .with_body(
                json!({ "result": { "aps": [
                    { "iid": "0001", "appname": "Outdoor", "apptype": "Global Data" },
                    { "iid": "0002", "appname": "AHU-1", "apptype": "AHU" }
                ]}})
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", ENDPOINT)
            .match_query(Matcher::Regex("GetPointValues".into()))
            .with_status(200)
            .with_body(r#"{"result":{"points":[]}}"#)
            .create_async()
            .await;

        let library = PointLibrary::from_iter([
            ("Global Data", vec!["OatOut"]),
            ("AHU", vec!["SupplyTemp", "FanStatus"]),
        ]);
        let controller = Arc::new(controller(&server, library));
        controller.refresh_inventory().await.unwrap();
        two_groups.remove_async().await;
        server
            .mock("POST", ENDPOINT)
            .match_query(Matcher::Regex("GetSystemInventory".into()))
            .with_status(200)
            .with_body(r#"{"result":{"aps":[{"iid":"0003","appname":"AHU-2","apptype":"AHU"}]}}"#)
            .create_async()
            .await;

        let snapshot = controller.inventory().await;
        let mut polled = Vec::new();
        for group in snapshot.groups() {
            controller.fetch_point_values(group).await.unwrap();
            polled.push(group.appname.clone());

            if polled.len() == 1 {
                let c = controller.clone();
                let refreshed = tokio::spawn(async move { c.refresh_inventory().await });
                assert_eq!(refreshed.await.unwrap().unwrap(), 1);
            }
        }

        assert_eq!(polled, vec!["Outdoor", "AHU-1"]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(controller.inventory().await.groups()[0].appname, "AHU-2");
    }

    #[tokio::test]
    async fn it_reports_failed_heartbeats() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", ENDPOINT)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"result":{"sid":"s-1"}}"#)
            .create_async()
            .await;
        server
            .mock("POST", ENDPOINT)
            .match_query(call("TouchSession", Some(json!({ "sid": "s-1" })), 2))
            .with_status(500)
            .create_async()
            .await;

        let controller = controller(&server, PointLibrary::default());
        let res = controller.touch_session().await;

        assert!(matches!(res, Err(ControllerError::RequestFailed(Method::TouchSession))));
    }
}
