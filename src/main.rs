use std::{
    future::IntoFuture,
    process,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::http::StatusCode;
use serde_json::json;
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use turbine::{
    App, AppError, Context, Engines, Handler, RouteRegistrar, config, handler,
    http::middleware::{recover, request_id},
    infra::{error::InfraError, telemetry},
    pubsub::PubSubError,
    queue::{QueueError, TaskError, task_handler},
};

const COUNTER_TTL: Duration = Duration::from_secs(3);
const NEWS_TOPIC: &str = "news";
const EMAIL_QUEUE: &str = "email";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let engines = Engines::from_settings(&settings)?;

    if let Some(queue) = &engines.queue {
        queue.register_worker(
            EMAIL_QUEUE,
            task_handler(|payload| async move {
                if payload.is_empty() {
                    return Err(TaskError::new("empty email payload"));
                }
                info!(queue = EMAIL_QUEUE, bytes = payload.len(), "email task handled");
                Ok(())
            }),
        )?;
    }

    let news_handle = match &engines.pubsub {
        Some(pubsub) => {
            let mut subscription = pubsub.subscribe(NEWS_TOPIC)?;
            Some(tokio::spawn(async move {
                while let Some(message) = subscription.recv().await {
                    info!(
                        topic = NEWS_TOPIC,
                        bytes = message.len(),
                        "news message received"
                    );
                }
            }))
        }
        None => None,
    };

    let app = build_app(&settings, engines.clone());
    let result = serve_http(&settings, app).await;

    if let Some(handle) = news_handle {
        handle.abort();
        let _ = handle.await;
    }
    let closed = engines.close();

    result.and(closed)
}

fn build_app(settings: &config::Settings, engines: Engines) -> App {
    let mut app = App::from_settings(settings, engines);
    app.use_middleware(request_id());
    app.use_middleware(recover());

    app.get("/health", [health()]).no_cache().named("health");
    app.get("/counter", [counter()])
        .cache(COUNTER_TTL)
        .named("counter");

    let mut api = app.group("/api");
    api.get("/users/:id", [show_user()]).named("user");
    api.post("/events/:topic", [publish_event()]).named("publish");
    api.post("/tasks/:queue", [enqueue_task()]).named("enqueue");

    app
}

fn health() -> Handler {
    handler(|c| {
        Box::pin(async move {
            c.json(StatusCode::OK, &json!({ "status": "ok" }));
        })
    })
}

fn counter() -> Handler {
    let hits = Arc::new(AtomicU64::new(0));
    handler(move |c| {
        let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move {
            c.json(StatusCode::OK, &json!({ "n": n }));
        })
    })
}

fn show_user() -> Handler {
    handler(|c| {
        Box::pin(async move {
            let id = c.param("id").unwrap_or_default().to_string();
            c.json(StatusCode::OK, &json!({ "id": id }));
        })
    })
}

fn publish_event() -> Handler {
    handler(|c| {
        Box::pin(async move {
            let topic = c.param("topic").unwrap_or_default().to_string();
            let published = c
                .pubsub()
                .map(|pubsub| pubsub.publish(&topic, c.body().clone()));
            match published {
                Ok(Ok(())) => c.json(StatusCode::ACCEPTED, &json!({ "topic": topic })),
                Ok(Err(PubSubError::InvalidTopic)) => {
                    c.json(StatusCode::BAD_REQUEST, &json!({ "error": "invalid topic" }))
                }
                Ok(Err(err)) => unavailable(c, &err.to_string()),
                Err(err) => unavailable(c, &err.to_string()),
            }
        })
    })
}

fn enqueue_task() -> Handler {
    handler(|c| {
        Box::pin(async move {
            let queue = c.param("queue").unwrap_or_default().to_string();
            let enqueued = c
                .queue()
                .map(|engine| engine.enqueue(&queue, c.body().clone()));
            match enqueued {
                Ok(Ok(())) => c.json(StatusCode::ACCEPTED, &json!({ "queue": queue })),
                Ok(Err(QueueError::InvalidQueueName)) => c.json(
                    StatusCode::BAD_REQUEST,
                    &json!({ "error": "invalid queue name" }),
                ),
                Ok(Err(err @ QueueError::Full { .. })) => c.json(
                    StatusCode::TOO_MANY_REQUESTS,
                    &json!({ "error": err.to_string() }),
                ),
                Ok(Err(err)) => unavailable(c, &err.to_string()),
                Err(err) => unavailable(c, &err.to_string()),
            }
        })
    })
}

fn unavailable(c: &mut Context, message: &str) {
    warn!(path = c.path(), error = message, "engine unavailable");
    c.json(StatusCode::SERVICE_UNAVAILABLE, &json!({ "error": message }));
}

async fn serve_http(settings: &config::Settings, app: App) -> Result<(), AppError> {
    let router = app.into_router()?;
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "turbine listening");

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            wait_for_ctrl_c().await;
            let _ = stop_tx.send(true);
        })
        .into_future();

    let grace = settings.server.graceful_shutdown;
    let deadline = async move {
        if stop_rx.wait_for(|stopping| *stopping).await.is_ok() {
            tokio::time::sleep(grace).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        () = deadline => {
            warn!(grace_secs = grace.as_secs(), "graceful shutdown timed out; dropping open connections");
        }
    }

    info!("turbine stopped");
    Ok(())
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => {
            error!(error = %err, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
