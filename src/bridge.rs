use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

use crate::hue_error::{fill_placeholders, BridgeError, RawBridgeError};
use crate::{Error, Result};

/// Path prefix every whitelisted call lives under
const API_BASE: &str = "api/<username>";

/// HTTP verbs the bridge API uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// Body for light and group state changes; unset fields are left alone by the bridge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LightState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on: Option<bool>,
    /// Brightness (0-255)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bri: Option<u8>,
    /// Hue (0-65535)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hue: Option<u16>,
    /// Saturation (0-255)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sat: Option<u8>,
    /// Color temperature in mireds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ct: Option<u16>,
    /// "none", "select" or "lselect"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    /// "none" or "colorloop"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    /// Transition duration in multiples of 100ms
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transitiontime: Option<u16>,
}

impl LightState {
    pub fn on() -> Self {
        Self {
            on: Some(true),
            ..Self::default()
        }
    }

    pub fn off() -> Self {
        Self {
            on: Some(false),
            ..Self::default()
        }
    }

    pub fn brightness(bri: u8) -> Self {
        Self {
            bri: Some(bri),
            ..Self::default()
        }
    }

    pub fn hue(hue: u16) -> Self {
        Self {
            hue: Some(hue),
            ..Self::default()
        }
    }
}

/// Client for one bridge, authenticated as one whitelisted user
#[derive(Debug, Clone)]
pub struct HueBridge {
    base_url: String,
    username: String,
    http: reqwest::Client,
}

impl HueBridge {
    /// Creates a client for the bridge at `base_url` (e.g. `http://192.168.1.37`)
    pub fn new(base_url: &str, username: &str) -> Result<Self> {
        let base_url = validate_base_url(base_url)?;
        Ok(Self {
            base_url,
            username: username.to_string(),
            http: reqwest::Client::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Registers a new whitelisted user and returns its generated name.
    ///
    /// The bridge's link button must have been pressed within the last 30 seconds.
    #[instrument]
    pub async fn create_user(base_url: &str, device_type: &str) -> Result<String> {
        let base_url = validate_base_url(base_url)?;
        let url = format!("{base_url}/api");
        let body = json!({ "devicetype": device_type });
        let keys = [("devicetype", device_type)];

        let response = send(&reqwest::Client::new(), Method::Post, &url, Some(&body), &keys).await?;
        response
            .get(0)
            .and_then(|entry| entry.pointer("/success/username"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::UnexpectedResponse(response.to_string()))
    }

    /// Builds the full URL for a path template below `api/<username>`
    pub fn url_for(&self, path_template: &str, keys: &[(&str, &str)]) -> String {
        let template = if path_template.is_empty() {
            format!("{}/{API_BASE}", self.base_url)
        } else {
            format!("{}/{API_BASE}/{path_template}", self.base_url)
        };
        fill_placeholders(&template, &self.keys_with_username(keys))
    }

    fn keys_with_username<'a>(&'a self, keys: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
        let mut all = keys.to_vec();
        if !keys.iter().any(|(key, _)| *key == "username") {
            all.push(("username", self.username.as_str()));
        }
        all
    }

    /// Issues one call against the bridge.
    ///
    /// `<key>` markers in `path_template` are replaced from `keys`; `<username>` is always
    /// known. Any error element in the response fails the whole call.
    #[instrument(skip(self, body), fields(bridge = %self.base_url))]
    pub async fn invoke(
        &self,
        method: Method,
        path_template: &str,
        keys: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let keys = self.keys_with_username(keys);
        let url = self.url_for(path_template, &keys);
        send(&self.http, method, &url, body, &keys).await
    }

    // Lights

    /// Every light the bridge knows, keyed by its id string
    pub async fn get_all_lights(&self) -> Result<Value> {
        self.invoke(Method::Get, "lights", &[], None).await
    }

    pub async fn get_light_attributes(&self, light_id: i64) -> Result<Value> {
        let id = light_id.to_string();
        self.invoke(Method::Get, "lights/<id>", &[("id", &id)], None)
            .await
    }

    /// Lights found by the last search
    pub async fn get_new_lights(&self) -> Result<Value> {
        self.invoke(Method::Get, "lights/new", &[], None).await
    }

    /// Starts a one minute search for new lights
    pub async fn search_for_new_lights(&self) -> Result<Value> {
        self.invoke(Method::Post, "lights", &[], None).await
    }

    pub async fn rename_light(&self, light_id: i64, name: &str) -> Result<Value> {
        let id = light_id.to_string();
        let body = json!({ "name": name });
        self.invoke(Method::Put, "lights/<id>", &[("id", &id)], Some(&body))
            .await
    }

    pub async fn set_light_state(&self, light_id: i64, state: &LightState) -> Result<Value> {
        let id = light_id.to_string();
        let body = serde_json::to_value(state)?;
        self.invoke(Method::Put, "lights/<id>/state", &[("id", &id)], Some(&body))
            .await
    }

    // Groups

    pub async fn get_all_groups(&self) -> Result<Value> {
        self.invoke(Method::Get, "groups", &[], None).await
    }

    pub async fn get_group_attributes(&self, group_id: i64) -> Result<Value> {
        let id = group_id.to_string();
        self.invoke(Method::Get, "groups/<id>", &[("id", &id)], None)
            .await
    }

    pub async fn set_group_attributes(&self, group_id: i64, attributes: &Value) -> Result<Value> {
        let id = group_id.to_string();
        self.invoke(Method::Put, "groups/<id>", &[("id", &id)], Some(attributes))
            .await
    }

    /// Group 0 always holds every light on the bridge
    pub async fn set_group_state(&self, group_id: i64, state: &LightState) -> Result<Value> {
        let id = group_id.to_string();
        let body = serde_json::to_value(state)?;
        self.invoke(Method::Put, "groups/<id>/action", &[("id", &id)], Some(&body))
            .await
    }

    // Schedules

    pub async fn get_all_schedules(&self) -> Result<Value> {
        self.invoke(Method::Get, "schedules", &[], None).await
    }

    pub async fn get_schedule_attributes(&self, schedule_id: i64) -> Result<Value> {
        let id = schedule_id.to_string();
        self.invoke(Method::Get, "schedules/<id>", &[("id", &id)], None)
            .await
    }

    pub async fn create_schedule(&self, schedule: &Value) -> Result<Value> {
        self.invoke(Method::Post, "schedules", &[], Some(schedule))
            .await
    }

    pub async fn set_schedule_attributes(&self, schedule_id: i64, attributes: &Value) -> Result<Value> {
        let id = schedule_id.to_string();
        self.invoke(Method::Put, "schedules/<id>", &[("id", &id)], Some(attributes))
            .await
    }

    pub async fn delete_schedule(&self, schedule_id: i64) -> Result<Value> {
        let id = schedule_id.to_string();
        self.invoke(Method::Delete, "schedules/<id>", &[("id", &id)], None)
            .await
    }

    // Configuration

    pub async fn get_configuration(&self) -> Result<Value> {
        self.invoke(Method::Get, "config", &[], None).await
    }

    pub async fn modify_configuration(&self, changes: &Value) -> Result<Value> {
        self.invoke(Method::Put, "config", &[], Some(changes)).await
    }

    /// Removes `user` from the bridge whitelist
    pub async fn delete_user(&self, user: &str) -> Result<Value> {
        self.invoke(
            Method::Delete,
            "config/whitelist/<user_to_delete>",
            &[("user_to_delete", user)],
            None,
        )
        .await
    }

    /// Lights, groups, schedules and configuration in one (expensive) call
    pub async fn get_full_state(&self) -> Result<Value> {
        self.invoke(Method::Get, "", &[], None).await
    }

    // Composed helpers

    /// Every light as `(name, base_id)`, ordered by id
    #[instrument(skip(self))]
    pub async fn list_lights(&self) -> Result<Vec<(String, i64)>> {
        let lights = self.get_all_lights().await?;
        let lights = parse_light_list(&lights)?;
        debug!("Bridge reported {} lights", lights.len());
        Ok(lights)
    }

    pub async fn turn_light_on(&self, light_id: i64) -> Result<Value> {
        self.set_light_state(light_id, &LightState::on()).await
    }

    pub async fn turn_light_off(&self, light_id: i64) -> Result<Value> {
        self.set_light_state(light_id, &LightState::off()).await
    }

    pub async fn set_light_brightness(&self, light_id: i64, bri: u8) -> Result<Value> {
        self.set_light_state(light_id, &LightState::brightness(bri))
            .await
    }

    pub async fn set_light_hue(&self, light_id: i64, hue: u16) -> Result<Value> {
        self.set_light_state(light_id, &LightState::hue(hue)).await
    }

    /// Turns every light on one by one, pausing `interval` after each
    pub async fn turn_all_lights_on(&self, interval: Duration) -> Result<()> {
        self.switch_all_lights(true, interval).await
    }

    /// Turns every light off one by one, pausing `interval` after each
    pub async fn turn_all_lights_off(&self, interval: Duration) -> Result<()> {
        self.switch_all_lights(false, interval).await
    }

    #[instrument(skip(self))]
    async fn switch_all_lights(&self, on: bool, interval: Duration) -> Result<()> {
        let lights = self.list_lights().await?;
        info!(
            "Turning {} lights {} one by one with interval of {:?}",
            lights.len(),
            if on { "on" } else { "off" },
            interval
        );
        let state = if on { LightState::on() } else { LightState::off() };
        for (name, id) in lights {
            trace!("Switching light {} ({})", name, id);
            self.set_light_state(id, &state).await?;
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }
        Ok(())
    }

    /// Sends `state` to every light at once; one result per light, in input order
    #[instrument(skip(self, state))]
    pub async fn set_lights_state(&self, light_ids: &[i64], state: &LightState) -> Vec<Result<Value>> {
        let results = join_all(light_ids.iter().map(|id| self.set_light_state(*id, state))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!("{} of {} light commands failed", failed, light_ids.len());
        }
        results
    }
}

fn validate_base_url(base_url: &str) -> Result<String> {
    let trimmed = base_url.trim_end_matches('/');
    let scheme = reqwest::Url::parse(trimmed)
        .map(|url| url.scheme().to_string())
        .unwrap_or_default();
    if scheme != "http" && scheme != "https" {
        return Err(Error::InvalidUrl(base_url.to_string()));
    }
    Ok(trimmed.to_string())
}

async fn send(
    http: &reqwest::Client,
    method: Method,
    url: &str,
    body: Option<&Value>,
    keys: &[(&str, &str)],
) -> Result<Value> {
    debug!("{:?} {}", method, url);
    let mut request = http.request(method.into(), url);
    if let Some(body) = body {
        request = request.json(body);
    }
    let text = request.send().await?.text().await?;
    let response = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text)?
    };
    trace!("Bridge response: {}", response);
    check_response(response, keys)
}

/// Fails on the first `{"error": ...}` element of a response array
pub(crate) fn check_response(response: Value, keys: &[(&str, &str)]) -> Result<Value> {
    if let Value::Array(entries) = &response {
        for entry in entries {
            if let Some(error) = entry.get("error") {
                let raw = RawBridgeError::from_element(error);
                let error = BridgeError::from_raw(raw, keys);
                warn!("Bridge reported error: {}", error);
                return Err(Error::Bridge(error));
            }
        }
    }
    Ok(response)
}

/// Decodes `{"1": {"name": ...}, ...}` into `(name, id)` pairs ordered by id
pub(crate) fn parse_light_list(lights: &Value) -> Result<Vec<(String, i64)>> {
    let entries = lights
        .as_object()
        .ok_or_else(|| Error::UnexpectedResponse(lights.to_string()))?;

    let mut parsed = Vec::with_capacity(entries.len());
    for (id, attributes) in entries {
        let base_id: i64 = id
            .trim()
            .parse()
            .map_err(|_| Error::UnexpectedResponse(format!("light id {id:?} is not numeric")))?;
        let name = attributes
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::UnexpectedResponse(format!("light {id} has no name")))?;
        parsed.push((name.to_string(), base_id));
    }
    parsed.sort_by_key(|(_, id)| *id);
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hue_error::BridgeErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned JSON response and hands back the raw request it received
    async fn serve_once(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            request
        });
        (format!("http://{addr}"), handle)
    }

    /// Reads the head and, if announced, the whole body of one request
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            received.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&received).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let content_length = text[..head_end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if received.len() >= head_end + 4 + content_length {
                    return text;
                }
            }
            if n == 0 {
                return text;
            }
        }
    }

    #[test]
    fn rejects_urls_without_http_scheme() {
        assert!(matches!(
            HueBridge::new("192.168.1.2", "user"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(
            HueBridge::new("ftp://192.168.1.2", "user"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(HueBridge::new("https://192.168.1.2/", "user").is_ok());
    }

    #[test]
    fn url_templates_are_filled() {
        let bridge = HueBridge::new("http://10.0.0.2/", "alice").unwrap();
        assert_eq!(
            bridge.url_for("lights/<id>/state", &[("id", "7")]),
            "http://10.0.0.2/api/alice/lights/7/state"
        );
        assert_eq!(bridge.url_for("", &[]), "http://10.0.0.2/api/alice");
        assert_eq!(
            bridge.url_for("config/whitelist/<user_to_delete>", &[("user_to_delete", "bob")]),
            "http://10.0.0.2/api/alice/config/whitelist/bob"
        );
    }

    #[test]
    fn light_state_serializes_only_set_fields() {
        let body = serde_json::to_value(LightState::brightness(200)).unwrap();
        assert_eq!(body, json!({ "bri": 200 }));
        let body = serde_json::to_value(LightState::off()).unwrap();
        assert_eq!(body, json!({ "on": false }));
    }

    #[test]
    fn error_elements_fail_the_call() {
        let response = json!([
            { "success": { "/lights/1/state/on": true } },
            { "error": { "type": 7, "address": "/lights/1/state/bri", "description": "invalid value" } }
        ]);
        let err = check_response(response, &[("value", "999"), ("parameter", "bri")]).unwrap_err();
        match err {
            Error::Bridge(error) => {
                assert_eq!(error.kind, BridgeErrorKind::InvalidValue);
                assert_eq!(error.message, "Invalid value, 999, for parameter, bri");
                assert_eq!(error.address, "/lights/1/state/bri");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_error_elements_keep_their_text() {
        let response = json!([{ "error": { "address": "/lights", "description": "odd failure" } }]);
        match check_response(response, &[]).unwrap_err() {
            Error::Bridge(error) => {
                assert_eq!(error.kind, BridgeErrorKind::Unknown(0));
                assert_eq!(error.message, "odd failure");
                assert_eq!(error.address, "/lights");
            }
            other => panic!("unexpected error: {other}"),
        }

        let response = json!([{ "error": "bridge busy" }]);
        match check_response(response, &[]).unwrap_err() {
            Error::Bridge(error) => assert_eq!(error.message, r#""bridge busy""#),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn success_responses_pass_through() {
        let response = json!([{ "success": { "/lights/1/state/on": true } }]);
        assert_eq!(check_response(response.clone(), &[]).unwrap(), response);
        let object = json!({ "1": { "name": "Bedroom" } });
        assert_eq!(check_response(object.clone(), &[]).unwrap(), object);
    }

    #[test]
    fn light_list_is_parsed_and_sorted() {
        let lights = json!({
            "10": { "name": "Hall" },
            "2": { "name": "Kitchen" },
            "1": { "name": "Bedroom" }
        });
        let parsed = parse_light_list(&lights).unwrap();
        assert_eq!(
            parsed,
            vec![
                ("Bedroom".to_string(), 1),
                ("Kitchen".to_string(), 2),
                ("Hall".to_string(), 10)
            ]
        );
        assert!(parse_light_list(&json!({ "x": { "name": "Odd" } })).is_err());
        assert!(parse_light_list(&json!([])).is_err());
    }

    #[tokio::test]
    async fn invoke_sends_body_to_templated_path() {
        let (url, server) = serve_once(r#"[{"success":{"/lights/3/state/on":true}}]"#).await;
        let bridge = HueBridge::new(&url, "alice").unwrap();

        let response = bridge.turn_light_on(3).await.unwrap();
        assert_eq!(response[0]["success"]["/lights/3/state/on"], json!(true));

        let request = server.await.unwrap();
        assert!(request.starts_with("PUT /api/alice/lights/3/state HTTP/1.1"));
        assert!(request.contains(r#"{"on":true}"#));
    }

    #[tokio::test]
    async fn unauthorized_user_is_classified() {
        let (url, server) = serve_once(
            r#"[{"error":{"type":1,"address":"/lights","description":"unauthorized user"}}]"#,
        )
        .await;
        let bridge = HueBridge::new(&url, "nobody").unwrap();

        let err = bridge.list_lights().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Bridge(BridgeError { kind: BridgeErrorKind::UnauthorizedUser, .. })
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn create_user_returns_generated_name() {
        let (url, server) = serve_once(r#"[{"success":{"username":"83b7780291a6ceffbe0bd049104df"}}]"#).await;

        let username = HueBridge::create_user(&url, "hue-groups").await.unwrap();
        assert_eq!(username, "83b7780291a6ceffbe0bd049104df");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api HTTP/1.1"));
        assert!(request.contains(r#""devicetype":"hue-groups""#));
    }
}
