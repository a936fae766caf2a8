// src/test_upstream.rs
//! Stand-in for the hosted identity, table and market services. Serves on an
//! ephemeral local port and records every request it answers.
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use warp::http::{HeaderMap, Method, StatusCode};
use warp::hyper::body::Bytes;
use warp::path::FullPath;
use warp::Filter;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

type Responder = dyn Fn(&Recorded) -> (u16, Value) + Send + Sync;

pub struct Upstream {
    pub url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Upstream {
    /// `respond` picks the status and JSON body for each request.
    pub fn start<F>(respond: F) -> Upstream
    where
        F: Fn(&Recorded) -> (u16, Value) + Send + Sync + 'static,
    {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();
        let respond: Arc<Responder> = Arc::new(respond);

        let route = warp::method()
            .and(warp::path::full())
            .and(warp::query::<HashMap<String, String>>())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .map(
                move |method: Method,
                      path: FullPath,
                      query: HashMap<String, String>,
                      headers: HeaderMap,
                      body: Bytes| {
                    let recorded = Recorded {
                        method,
                        path: path.as_str().to_string(),
                        query,
                        headers,
                        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
                    };
                    let (status, reply) = respond(&recorded);
                    log.lock().unwrap().push(recorded);
                    warp::reply::with_status(
                        warp::reply::json(&reply),
                        StatusCode::from_u16(status).unwrap(),
                    )
                },
            );

        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        Upstream {
            url: format!("http://{}", addr),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    /// The only request made so far.
    pub fn single(&self) -> Recorded {
        let requests = self.requests();
        assert_eq!(requests.len(), 1, "expected exactly one upstream request");
        requests[0].clone()
    }
}
