//! Contacts API behind the standard protection pipeline.
//!
//! ```text
//! cargo run --example contacts_server
//! curl -X POST localhost:8080/contacts -d '{"first_name":"Ada","last_name":"Lovelace","email":"ada@example.com"}'
//! curl localhost:8080/contacts/1
//! ```
//!
//! Set `RTTP_SHIELD_CONFIG=path/to/config.json` to override the defaults and
//! `RUST_LOG=rttp_shield=debug` to watch cache hits and rejections.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use rttp_shield::{
    Context, Method, Response, StatusCode,
    cache::{CacheStrategy, MemoryStore},
    config::PipelineConfig,
    middleware::ValidationMiddleware,
    pipeline,
    server::Server,
};
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Default)]
struct Contacts {
    next_id: AtomicU64,
    rows: Mutex<BTreeMap<u64, Value>>,
}

impl Contacts {
    fn handle(&self, ctx: &Context) -> Response {
        let request = ctx.request();
        let segments: Vec<&str> = request.path().trim_matches('/').split('/').collect();

        match (request.method(), segments.as_slice()) {
            (Method::Get, ["contacts"]) => {
                let rows: Vec<Value> = self.rows.lock().values().cloned().collect();
                Response::json(StatusCode::Ok, &rows)
            }
            (Method::Post, ["contacts"]) => {
                let Ok(mut contact) = ctx.json::<Value>() else {
                    return Response::error(StatusCode::BadRequest, "Invalid request payload");
                };
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                contact["id"] = json!(id);
                self.rows.lock().insert(id, contact.clone());
                Response::json(StatusCode::Created, &contact)
                    .header("Location", format!("/contacts/{id}"))
            }
            (method, ["contacts", id]) => {
                let Ok(id) = id.parse::<u64>() else {
                    return Response::error(StatusCode::BadRequest, "Invalid contact id");
                };
                self.handle_one(method, id, ctx)
            }
            _ => Response::error(StatusCode::NotFound, "Not found"),
        }
    }

    fn handle_one(&self, method: &Method, id: u64, ctx: &Context) -> Response {
        let mut rows = self.rows.lock();
        match method {
            Method::Get | Method::Head => match rows.get(&id) {
                Some(contact) => Response::json(StatusCode::Ok, contact),
                None => Response::error(StatusCode::NotFound, "Contact not found"),
            },
            Method::Put => {
                let Ok(mut contact) = ctx.json::<Value>() else {
                    return Response::error(StatusCode::BadRequest, "Invalid request payload");
                };
                if !rows.contains_key(&id) {
                    return Response::error(StatusCode::NotFound, "Contact not found");
                }
                contact["id"] = json!(id);
                rows.insert(id, contact.clone());
                Response::json(StatusCode::Ok, &contact)
            }
            Method::Delete => match rows.remove(&id) {
                Some(_) => Response::new(StatusCode::NoContent),
                None => Response::error(StatusCode::NotFound, "Contact not found"),
            },
            _ => Response::error(StatusCode::MethodNotAllowed, "Method not allowed"),
        }
    }
}

fn validate_contact(payload: &Value) -> Result<(), String> {
    for field in ["first_name", "last_name"] {
        match payload.get(field).and_then(Value::as_str) {
            Some(value) if (2..=100).contains(&value.chars().count()) => {}
            _ => return Err(format!("{field} must be between 2 and 100 characters")),
        }
    }
    match payload.get("email").and_then(Value::as_str) {
        Some(email) if email.contains('@') => Ok(()),
        _ => Err("email must be a valid address".to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::var("RTTP_SHIELD_CONFIG") {
        Ok(path) => PipelineConfig::load(path)?,
        Err(_) => {
            let mut config = PipelineConfig::default();
            config.cache.key_prefix = "contacts".to_string();
            config.cache.strategy = CacheStrategy::WriteThrough;
            config.cache.invalidate_on = vec![Method::Delete];
            config
        }
    };

    let contacts = Arc::new(Contacts::default());
    let pipeline = pipeline::standard(&config, Arc::new(MemoryStore::new()), None)?
        .with(ValidationMiddleware::new(validate_contact))
        .finish(move |ctx: Context| {
            let response = contacts.handle(&ctx);
            async move { response }
        });

    let server = Server::from_config(&config.server).await?;
    tracing::info!(address = %server.local_addr(), "contacts API ready");
    server.run(pipeline).await?;
    Ok(())
}
