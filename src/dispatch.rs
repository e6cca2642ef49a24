// Request dispatcher: validates requests and drives the reconciler

use crate::backends::RuleExecutor;
use crate::mac::MacAddr;
use crate::rate::{Rate, Rates};
use crate::reconciler::Reconciler;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Result codes, numbered like ubus status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    InvalidArgument = 2,
    NotFound = 4,
    UnknownError = 9,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RequestError {
    pub fn status(&self) -> Status {
        match self {
            RequestError::InvalidArgument(_) => Status::InvalidArgument,
            RequestError::NotFound(_) => Status::NotFound,
            RequestError::Internal(_) => Status::UnknownError,
        }
    }
}

fn invalid(msg: impl Into<String>) -> RequestError {
    RequestError::InvalidArgument(msg.into())
}

/// Rate fields shared by `defaults.set` and `client.set`
///
/// `rate` applies to both directions; the directional fields win over it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateParams {
    pub rate: Option<String>,
    pub rate_egress: Option<String>,
    pub rate_ingress: Option<String>,
}

impl RateParams {
    fn resolve(&self) -> Result<Rates, RequestError> {
        let both = parse_rate("rate", &self.rate)?;
        let egress = parse_rate("rate_egress", &self.rate_egress)?;
        let ingress = parse_rate("rate_ingress", &self.rate_ingress)?;

        Ok(Rates::new(
            egress.or_else(|| both.clone()),
            ingress.or(both),
        ))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DefaultsSetParams {
    pub name: Option<String>,
    #[serde(flatten)]
    pub rates: RateParams,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientSetParams {
    pub device: Option<String>,
    pub address: Option<String>,
    pub defaults: Option<String>,
    #[serde(flatten)]
    pub rates: RateParams,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientDeleteParams {
    pub address: Option<String>,
    pub device: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceDeleteParams {
    pub device: Option<String>,
}

/// A decoded request
#[derive(Debug, Clone)]
pub enum Request {
    SetDefaults(DefaultsSetParams),
    SetClient(ClientSetParams),
    DeleteClient(ClientDeleteParams),
    DeleteDevice(DeviceDeleteParams),
    Reload,
    Status,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    method: String,
    #[serde(default)]
    params: Value,
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::SetDefaults(_) => "defaults.set",
            Request::SetClient(_) => "client.set",
            Request::DeleteClient(_) => "client.delete",
            Request::DeleteDevice(_) => "device.delete",
            Request::Reload => "reload",
            Request::Status => "status",
        }
    }

    /// Decode one JSON request line: `{"method": "...", "params": {...}}`
    pub fn from_json(line: &str) -> Result<Self, RequestError> {
        let envelope: Envelope = serde_json::from_str(line)
            .map_err(|e| invalid(format!("malformed request: {}", e)))?;

        let params = match envelope.params {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        fn decode<T: DeserializeOwned>(params: Value) -> Result<T, RequestError> {
            serde_json::from_value(params).map_err(|e| invalid(format!("bad params: {}", e)))
        }

        match envelope.method.as_str() {
            "defaults.set" => decode(params).map(Request::SetDefaults),
            "client.set" => decode(params).map(Request::SetClient),
            "client.delete" => decode(params).map(Request::DeleteClient),
            "device.delete" => decode(params).map(Request::DeleteDevice),
            "reload" => Ok(Request::Reload),
            "status" => Ok(Request::Status),
            other => Err(invalid(format!("unknown method {:?}", other))),
        }
    }
}

/// Reply to a single request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub status: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            status: Status::Ok.code(),
            message: None,
            data,
        }
    }

    pub fn error(err: &RequestError) -> Self {
        Self {
            status: err.status().code(),
            message: Some(err.to_string()),
            data: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ClientStatus {
    address: String,
    id: usize,
    #[serde(flatten)]
    rates: Rates,
}

#[derive(Debug, Serialize)]
struct DeviceStatus {
    name: String,
    mirror: String,
    degraded: bool,
    /// Highest client id ever handed out, plus one
    slots: usize,
    clients: Vec<ClientStatus>,
}

fn required<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str, RequestError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(invalid(format!("missing {}", field))),
    }
}

fn parse_rate(field: &str, value: &Option<String>) -> Result<Option<Rate>, RequestError> {
    value
        .as_deref()
        .map(str::parse::<Rate>)
        .transpose()
        .map_err(|e| invalid(format!("{}: {:#}", field, e)))
}

fn parse_address(value: &str) -> Result<MacAddr, RequestError> {
    value
        .parse()
        .map_err(|e: anyhow::Error| invalid(format!("address: {:#}", e)))
}

/// Maps requests onto the reconciler, one at a time
pub struct Dispatcher<E: RuleExecutor> {
    reconciler: Reconciler<E>,
    defaults: BTreeMap<String, Rates>,
}

impl<E: RuleExecutor> Dispatcher<E> {
    pub fn new(executor: E, defaults: BTreeMap<String, Rates>) -> Self {
        Self {
            reconciler: Reconciler::new(executor),
            defaults,
        }
    }

    #[cfg(test)]
    pub fn reconciler(&self) -> &Reconciler<E> {
        &self.reconciler
    }

    #[cfg(test)]
    pub fn reconciler_mut(&mut self) -> &mut Reconciler<E> {
        &mut self.reconciler
    }

    pub fn handle(&mut self, request: Request) -> Response {
        let method = request.method();
        let result = match request {
            Request::SetDefaults(params) => self.set_defaults(params),
            Request::SetClient(params) => self.set_client(params),
            Request::DeleteClient(params) => self.delete_client(params),
            Request::DeleteDevice(params) => self.delete_device(params),
            Request::Reload => self.reload(),
            Request::Status => self.status(),
        };

        match result {
            Ok(data) => Response::ok(data),
            Err(e) => {
                log::info!("{} rejected: {}", method, e);
                Response::error(&e)
            }
        }
    }

    fn set_defaults(&mut self, params: DefaultsSetParams) -> Result<Option<Value>, RequestError> {
        let name = required("name", &params.name)?;
        let rates = params.rates.resolve()?;
        if rates.is_empty() {
            return Err(invalid("no rate given"));
        }

        log::info!("Default profile {} set to {}", name, rates);
        self.defaults.insert(name.to_string(), rates);
        Ok(None)
    }

    fn set_client(&mut self, params: ClientSetParams) -> Result<Option<Value>, RequestError> {
        let device = required("device", &params.device)?;
        let address = parse_address(required("address", &params.address)?)?;

        let mut rates = params.rates.resolve()?;
        if let Some(name) = params.defaults.as_deref() {
            match self.defaults.get(name) {
                Some(profile) => rates = rates.or(profile),
                None => log::debug!("Unknown default profile {}, ignoring", name),
            }
        }
        if rates.is_empty() {
            return Err(invalid("no rate given"));
        }

        self.reconciler
            .ensure_device(device)
            .map_err(|e| invalid(format!("cannot set up device {}: {:#}", device, e)))?;

        let id = self
            .reconciler
            .set_client(device, &address, rates)
            .map_err(|e| RequestError::Internal(format!("{:#}", e)))?;

        Ok(Some(serde_json::json!({ "id": id })))
    }

    fn delete_client(&mut self, params: ClientDeleteParams) -> Result<Option<Value>, RequestError> {
        let address = parse_address(required("address", &params.address)?)?;

        match params.device.as_deref() {
            Some(device) => {
                if !self.reconciler.registry().contains(device) {
                    return Err(RequestError::NotFound(format!("device {}", device)));
                }
                self.reconciler
                    .delete_client(device, &address)
                    .ok_or_else(|| {
                        RequestError::NotFound(format!("client {} on {}", address, device))
                    })?;
            }
            None => {
                let removed = self.reconciler.delete_client_everywhere(&address);
                log::debug!("{} removed from {} device(s)", address, removed);
            }
        }

        Ok(None)
    }

    fn delete_device(&mut self, params: DeviceDeleteParams) -> Result<Option<Value>, RequestError> {
        let device = required("device", &params.device)?;

        self.reconciler
            .delete_device(device)
            .ok_or_else(|| RequestError::NotFound(format!("device {}", device)))?;

        Ok(None)
    }

    fn reload(&mut self) -> Result<Option<Value>, RequestError> {
        let report = self.reconciler.reload();
        let data = serde_json::to_value(report)
            .map_err(|e| RequestError::Internal(e.to_string()))?;
        Ok(Some(data))
    }

    fn status(&self) -> Result<Option<Value>, RequestError> {
        let devices: Vec<DeviceStatus> = self
            .reconciler
            .registry()
            .iter()
            .map(|d| DeviceStatus {
                name: d.name.clone(),
                mirror: d.mirror.clone(),
                degraded: d.degraded,
                slots: d.slots().len(),
                clients: d
                    .clients()
                    .into_iter()
                    .map(|c| ClientStatus {
                        address: c.address.to_string(),
                        id: c.id,
                        rates: c.rates.clone(),
                    })
                    .collect(),
            })
            .collect();

        Ok(Some(serde_json::json!({
            "devices": devices,
            "defaults": self.defaults,
        })))
    }

    /// Tear everything down; the dispatcher must not be used afterwards
    pub fn shutdown(&mut self) {
        self.reconciler.shutdown();
    }
}
