use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::json;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::engine::{AccessEngine, EngineError, EngineResult};
use crate::schedule::ScheduleConfig;

/// Thin JSON control surface over the engine's exposed operations.
/// Carries no policy of its own; every route maps 1:1 onto an engine call.

#[derive(Deserialize)]
struct AllowQuery {
    minutes: i64,
}

fn with_engine(
    engine: AccessEngine,
) -> impl Filter<Extract = (AccessEngine,), Error = Infallible> + Clone {
    warp::any().map(move || engine.clone())
}

fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::Validation(_) | EngineError::Schedule(_) => StatusCode::BAD_REQUEST,
        EngineError::UnknownSubject(_) => StatusCode::NOT_FOUND,
        EngineError::NoUpcomingWindow(_) => StatusCode::CONFLICT,
        EngineError::RuleMissing(_)
        | EngineError::GroupNotFound(_)
        | EngineError::Upstream(_) => StatusCode::BAD_GATEWAY,
        EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply_with<T: Serialize>(
    result: EngineResult<T>,
) -> Result<warp::reply::WithStatus<warp::reply::Json>, Infallible> {
    Ok(match result {
        Ok(value) => warp::reply::with_status(warp::reply::json(&value), StatusCode::OK),
        Err(e) => warp::reply::with_status(
            warp::reply::json(&json!({ "error": e.to_string() })),
            status_for(&e),
        ),
    })
}

pub fn routes(
    engine: AccessEngine,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let subjects = warp::path!("api" / "subjects")
        .and(warp::get())
        .and(with_engine(engine.clone()))
        .and_then(|engine: AccessEngine| async move {
            reply_with(engine.subject_states().await)
        });

    let toggle = warp::path!("api" / "subjects" / String / "toggle")
        .and(warp::post())
        .and(with_engine(engine.clone()))
        .and_then(|name: String, engine: AccessEngine| async move {
            reply_with(
                engine
                    .toggle_manual(&name)
                    .await
                    .map(|blocked| json!({ "blocked": blocked })),
            )
        });

    let schedule_toggle = warp::path!("api" / "subjects" / String / "schedule" / "toggle")
        .and(warp::post())
        .and(with_engine(engine.clone()))
        .and_then(|name: String, engine: AccessEngine| async move {
            reply_with(
                engine
                    .toggle_schedule_enabled(&name)
                    .await
                    .map(|enabled| json!({ "enabled": enabled })),
            )
        });

    let timed_allow = warp::path!("api" / "subjects" / String / "allow")
        .and(warp::post())
        .and(warp::query::<AllowQuery>())
        .and(with_engine(engine.clone()))
        .and_then(|name: String, query: AllowQuery, engine: AccessEngine| async move {
            reply_with(
                engine
                    .start_timed_allow(&name, query.minutes)
                    .await
                    .map(|until| json!({ "until": until })),
            )
        });

    let cancel_timer = warp::path!("api" / "subjects" / String / "allow")
        .and(warp::delete())
        .and(with_engine(engine.clone()))
        .and_then(|name: String, engine: AccessEngine| async move {
            reply_with(
                engine
                    .cancel_timer(&name)
                    .await
                    .map(|cancelled| json!({ "cancelled": cancelled })),
            )
        });

    let skip = warp::path!("api" / "subjects" / String / "skip")
        .and(warp::post())
        .and(with_engine(engine.clone()))
        .and_then(|name: String, engine: AccessEngine| async move {
            reply_with(
                engine
                    .start_skip(&name)
                    .await
                    .map(|until| json!({ "until": until })),
            )
        });

    let cancel_skip = warp::path!("api" / "subjects" / String / "skip")
        .and(warp::delete())
        .and(with_engine(engine.clone()))
        .and_then(|name: String, engine: AccessEngine| async move {
            reply_with(
                engine
                    .cancel_skip(&name)
                    .await
                    .map(|cancelled| json!({ "cancelled": cancelled })),
            )
        });

    let save_schedules = warp::path!("api" / "schedules")
        .and(warp::put())
        .and(warp::body::content_length_limit(64 * 1024))
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(
            |map: HashMap<String, ScheduleConfig>, engine: AccessEngine| async move {
                reply_with(engine.save_schedules(map).await.map(|_| json!({ "saved": true })))
            },
        );

    let allow_all = warp::path!("api" / "allow-all")
        .and(warp::post())
        .and(with_engine(engine.clone()))
        .and_then(|engine: AccessEngine| async move {
            reply_with(engine.allow_all().await.map(|_| json!({ "ok": true })))
        });

    let block_all = warp::path!("api" / "block-all")
        .and(warp::post())
        .and(with_engine(engine.clone()))
        .and_then(|engine: AccessEngine| async move {
            reply_with(engine.block_all().await.map(|_| json!({ "ok": true })))
        });

    let reconcile = warp::path!("api" / "reconcile")
        .and(warp::post())
        .and(with_engine(engine.clone()))
        .and_then(|engine: AccessEngine| async move {
            reply_with(
                engine
                    .run_tick()
                    .await
                    .map(|corrected| json!({ "corrected": corrected })),
            )
        });

    let audit = warp::path!("api" / "audit")
        .and(warp::get())
        .and(with_engine(engine))
        .and_then(|engine: AccessEngine| async move {
            reply_with(Ok(engine.audit_entries().await))
        });

    subjects
        .or(toggle)
        .or(schedule_toggle)
        .or(timed_allow)
        .or(cancel_timer)
        .or(skip)
        .or(cancel_skip)
        .or(save_schedules)
        .or(allow_all)
        .or(block_all)
        .or(reconcile)
        .or(audit)
}

/// Serve the control API until the process exits.
pub async fn serve(engine: AccessEngine, addr: SocketAddr) {
    warp::serve(routes(engine)).run(addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{rig, rule, subject};
    use crate::upstream::RuleSource;

    #[tokio::test]
    async fn subjects_route_returns_states() {
        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule("r1", "tr1", true, RuleSource::Address("10.0.0.2".into()))],
        )
        .await;
        let routes = routes(rig.engine.clone());

        let resp = warp::test::request()
            .method("GET")
            .path("/api/subjects")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body[0]["name"], "kid");
        assert_eq!(body[0]["blocked"], false);
    }

    #[tokio::test]
    async fn toggle_route_flips_and_reports() {
        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule("r1", "tr1", true, RuleSource::Address("10.0.0.2".into()))],
        )
        .await;
        let routes = routes(rig.engine.clone());

        let resp = warp::test::request()
            .method("POST")
            .path("/api/subjects/kid/toggle")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["blocked"], true);
    }

    #[tokio::test]
    async fn unknown_subject_maps_to_not_found() {
        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule("r1", "tr1", true, RuleSource::Address("10.0.0.2".into()))],
        )
        .await;
        let routes = routes(rig.engine.clone());

        let resp = warp::test::request()
            .method("POST")
            .path("/api/subjects/nobody/toggle")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_minutes_maps_to_bad_request() {
        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule("r1", "tr1", true, RuleSource::Address("10.0.0.2".into()))],
        )
        .await;
        let routes = routes(rig.engine.clone());

        let resp = warp::test::request()
            .method("POST")
            .path("/api/subjects/kid/allow?minutes=0")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn skip_without_window_maps_to_conflict() {
        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule("r1", "tr1", true, RuleSource::Address("10.0.0.2".into()))],
        )
        .await;
        let routes = routes(rig.engine.clone());

        let resp = warp::test::request()
            .method("POST")
            .path("/api/subjects/kid/skip")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
