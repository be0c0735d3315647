#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rosterharvest::{
    PortalConfig,
    fetch::{FetchError, XmlSource},
    notify::{Notification, Notifier},
    scrape::{BatchSettings, Selection},
    xml::{XmlFragment, parse_fragment},
};

#[macro_export]
macro_rules! assert_transforms {
    (
        $(
            $test_name:ident : transform => $transform:expr, part => $part:expr, raw => $raw:expr, result => $result:expr
        ),+ $(,)?
    ) => {
        $(
            #[test]
            fn $test_name() {
                let kind: rosterharvest::transform::TransformKind =
                    $transform.parse().expect("Expected a known transform.");
                let result = kind
                    .apply($raw)
                    .and_then(|transformed| transformed.part($part))
                    .expect("Expected successful transform.");

                assert_that(&result).is_equal_to($result.to_owned());
            }
        )+
    }
}

pub const COURSES_XML: &str = "<rows>\
    <row><cell>ADS - Análise e Desenvolvimento de Sistemas</cell></row>\
    <row><cell>SI - Sistemas de Informação</cell></row>\
    </rows>";

pub const ADS_NAME: &str = "Análise e Desenvolvimento de Sistemas";

pub const SCHEDULE_TITLE: &str = "Segunda das 19:10 às 20:25.Quarta das 19:10 às 20:25";

/// One `listarOfertas` row whose descriptor carries `id`.
pub fn offering_row(id: usize) -> String {
    format!(
        "<row><cell>MAT{id} - Cálculo {id}</cell>\
         <cell>X_2.1910<b>({id})</b></cell>\
         <cell title=\"{SCHEDULE_TITLE}\">Seg/Qua</cell>\
         <cell>40</cell><cell>35</cell><cell>2025/2</cell></row>"
    )
}

pub fn offerings_listing(ids: &[usize]) -> String {
    let rows: String = ids.iter().map(|id| offering_row(*id)).collect();
    format!("<rows>{rows}</rows>")
}

pub fn professors_xml(id: usize) -> String {
    format!("<rows><row><cell>{id}</cell><cell>Prof. {id}</cell></row></rows>")
}

/// Consecutive offering ids starting at 1000.
pub fn offering_ids(count: usize) -> Vec<usize> {
    (1000..1000 + count).collect()
}

/// Portal serving an offerings listing with professors and courses for every id.
pub fn offerings_portal(ids: &[usize]) -> StubPortal {
    let mut portal = StubPortal::new()
        .route("listarOfertas", offerings_listing(ids))
        .route("listarCursosOferta", COURSES_XML);
    for id in ids {
        portal = portal.route_for(
            "listarProfessoresOferta",
            ("idOferta", &id.to_string()),
            professors_xml(*id),
        );
    }
    portal
}

pub fn settings(batch_size: usize) -> BatchSettings {
    BatchSettings {
        batch_size,
        delay: Duration::ZERO,
        timeout: Duration::from_secs(1),
    }
}

/// Embedded descriptor tuned for fast tests.
pub fn test_config(batch_size: usize) -> PortalConfig {
    let mut config = PortalConfig::load(None).expect("Expected embedded config to load.");
    config.batch_size = batch_size;
    config.batch_delay_ms = 0;
    config.timeout_ms = 1_000;
    config
}

pub fn selection(pairs: &[(&str, &str)]) -> Selection {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
        .collect()
}

struct Route {
    endpoint: String,
    param: Option<(String, String)>,
    response: Result<String, FetchError>,
}

/// In-process portal double. Answers from canned routes, counts concurrent
/// fetches and logs every request as `endpoint?k=v&...`.
pub struct StubPortal {
    routes: Vec<Route>,
    latency: Duration,
    jitter: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl StubPortal {
    pub fn new() -> Self {
        StubPortal {
            routes: Vec::new(),
            latency: Duration::ZERO,
            jitter: true,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Each fetch sleeps one to three times `latency`, so completions interleave.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every fetch sleeps exactly `latency`.
    pub fn with_fixed_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self.jitter = false;
        self
    }

    pub fn route(mut self, endpoint: &str, xml: impl Into<String>) -> Self {
        self.routes.push(Route {
            endpoint: endpoint.to_string(),
            param: None,
            response: Ok(xml.into()),
        });
        self
    }

    pub fn route_for(mut self, endpoint: &str, param: (&str, &str), xml: impl Into<String>) -> Self {
        self.routes.push(Route {
            endpoint: endpoint.to_string(),
            param: Some((param.0.to_string(), param.1.to_string())),
            response: Ok(xml.into()),
        });
        self
    }

    pub fn fail(mut self, endpoint: &str, error: FetchError) -> Self {
        self.routes.push(Route {
            endpoint: endpoint.to_string(),
            param: None,
            response: Err(error),
        });
        self
    }

    pub fn fail_for(mut self, endpoint: &str, param: (&str, &str), error: FetchError) -> Self {
        self.routes.push(Route {
            endpoint: endpoint.to_string(),
            param: Some((param.0.to_string(), param.1.to_string())),
            response: Err(error),
        });
        self
    }

    pub fn into_source(self) -> (Arc<StubPortal>, Arc<dyn XmlSource>) {
        let portal = Arc::new(self);
        let source: Arc<dyn XmlSource> = portal.clone();
        (portal, source)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.log.lock().expect("Expected request log.").clone()
    }

    pub fn requests_to(&self, endpoint: &str) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|request| request.split('?').next() == Some(endpoint))
            .collect()
    }

    fn respond(&self, endpoint: &str, params: &[(String, Option<String>)]) -> Result<XmlFragment, FetchError> {
        let present: HashMap<&str, &str> = params
            .iter()
            .filter_map(|(name, value)| value.as_deref().map(|value| (name.as_str(), value)))
            .collect();
        let matches_param = |route: &&Route| match &route.param {
            Some((name, value)) => present.get(name.as_str()) == Some(&value.as_str()),
            None => false,
        };

        // Later routes override earlier ones; parameter routes beat plain ones.
        let route = self
            .routes
            .iter()
            .rev()
            .filter(|route| route.endpoint == endpoint)
            .find(matches_param)
            .or_else(|| {
                self.routes
                    .iter()
                    .rev()
                    .find(|route| route.endpoint == endpoint && route.param.is_none())
            });

        match route {
            Some(Route {
                response: Ok(xml), ..
            }) => parse_fragment(xml),
            Some(Route {
                response: Err(error),
                ..
            }) => Err(error.clone()),
            None => Err(FetchError::HttpStatus(404)),
        }
    }
}

fn describe(endpoint: &str, params: &[(String, Option<String>)]) -> String {
    let query = params
        .iter()
        .filter_map(|(name, value)| value.as_ref().map(|value| format!("{name}={value}")))
        .collect::<Vec<_>>()
        .join("&");
    format!("{endpoint}?{query}")
}

#[async_trait]
impl XmlSource for StubPortal {
    async fn fetch_xml(
        &self,
        endpoint: &str,
        params: &[(String, Option<String>)],
        _timeout: Duration,
    ) -> Result<XmlFragment, FetchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .expect("Expected request log.")
            .push(describe(endpoint, params));

        if !self.latency.is_zero() {
            let factor = if self.jitter {
                u32::try_from(call % 3 + 1).unwrap_or(1)
            } else {
                1
            };
            tokio::time::sleep(self.latency * factor).await;
        }

        let response = self.respond(endpoint, params);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

/// Notifier that keeps everything it receives.
#[derive(Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().expect("Expected notifications.").clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.received
            .lock()
            .expect("Expected notifications.")
            .push(notification);
    }
}
