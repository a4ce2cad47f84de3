//! Read-only HTTP/JSON inspection surface over a finished [`Snapshot`].
//! Handlers never mutate state; the snapshot is fully built (and analyzed,
//! if retained sizes are wanted elsewhere) before the server starts.

use crate::snapshot::{parse_kind_filter, Snapshot};
use actix_web::{web, App, HttpResponse, HttpServer};
use log::info;
use serde::{Deserialize, Serialize};
use std::io;

struct AppState {
    snapshot: Snapshot,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(e: impl std::fmt::Display) -> HttpResponse {
    HttpResponse::InternalServerError().json(ErrorBody {
        error: e.to_string(),
    })
}

async fn handler_classes(state: web::Data<AppState>) -> HttpResponse {
    match state.snapshot.class_statistics() {
        Ok(stats) => HttpResponse::Ok().json(stats),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct InstancesQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn handler_class_instances(
    state: web::Data<AppState>,
    path: web::Path<u64>,
    query: web::Query<InstancesQuery>,
) -> HttpResponse {
    let class_id = path.into_inner();
    let filter = query.kind.as_deref().and_then(parse_kind_filter);
    match state.snapshot.instances_of(class_id, filter) {
        Ok(instances) => HttpResponse::Ok().json(instances),
        Err(e) => error_response(e),
    }
}

async fn handler_instance(state: web::Data<AppState>, path: web::Path<u64>) -> HttpResponse {
    let obj_id = path.into_inner();
    match state.snapshot.instance_detail(obj_id) {
        Ok(Some(view)) => HttpResponse::Ok().json(view),
        Ok(None) => HttpResponse::NotFound().json(ErrorBody {
            error: format!("no record with id {}", obj_id),
        }),
        Err(e) => error_response(e),
    }
}

async fn handler_inbound(state: web::Data<AppState>, path: web::Path<u64>) -> HttpResponse {
    let obj_id = path.into_inner();
    match state.snapshot.inbound_references(obj_id) {
        Ok(refs) => HttpResponse::Ok().json(refs),
        Err(e) => error_response(e),
    }
}

async fn handler_threads(state: web::Data<AppState>) -> HttpResponse {
    match state.snapshot.threads() {
        Ok(threads) => HttpResponse::Ok().json(threads),
        Err(e) => error_response(e),
    }
}

/// Serve the inspection API until interrupted.
pub fn serve(snapshot: Snapshot, address: &str) -> io::Result<()> {
    let address = address.to_owned();
    let state = web::Data::new(AppState { snapshot });

    info!("serving inspection API on http://{}", address);

    let mut sys = actix_web::rt::System::new("hprof-analyzer-web");
    sys.block_on(async move {
        HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .service(web::resource("/api/classes").route(web::get().to(handler_classes)))
                .service(
                    web::resource("/api/classes/{id}/instances")
                        .route(web::get().to(handler_class_instances)),
                )
                .service(web::resource("/api/instances/{id}").route(web::get().to(handler_instance)))
                .service(
                    web::resource("/api/references/{id}/inbound")
                        .route(web::get().to(handler_inbound)),
                )
                .service(web::resource("/api/threads").route(web::get().to(handler_threads)))
        })
        .bind(&address)?
        .run()
        .await
    })
}
