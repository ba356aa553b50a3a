use std::sync::Arc;

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use judge::catalog::StaticCatalog;
use judge::config::{CliArgs, Config, StoreConfig};
use judge::database::{self as db, SqliteStore};
use judge::queue::JobQueue;
use judge::recorder::{Recorder, RetryPolicy};
use judge::service::JudgeService;
use judge::store::{HistoryStore, MemoryStore};
use judge::web_server::build_server;
use judge::worker::worker;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        judge: judge_config,
        sandbox: sandbox_config,
        store: store_config,
        recorder: recorder_config,
        problems,
    } = cli.to_config().expect("Failed to load configuration");

    let store: Arc<dyn HistoryStore> = match store_config {
        StoreConfig::Sqlite { path } => {
            let db_path = match path {
                Some(path) => path,
                None => db::get_db_path().expect("Failed to locate local data dir"),
            };
            if cli.flush_data {
                db::remove_db(&db_path);
            }
            let store = SqliteStore::open(&db_path)
                .await
                .expect("Failed to initialize database");
            Arc::new(store)
        }
        StoreConfig::Memory => {
            log::warn!("Using in-memory store, judged history will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let catalog = StaticCatalog::new(problems).expect("Failed to load problem catalog");

    let n_workers = judge_config.workers;

    let recorder = Arc::new(Recorder::new(store, RetryPolicy::from(&recorder_config)));
    let queue = Arc::new(JobQueue::new(judge_config.queue_depth));
    let service = Arc::new(JudgeService::new(
        Arc::new(catalog),
        queue.clone(),
        recorder.clone(),
    ));
    let judge_config = Arc::new(judge_config);
    let sandbox_config = Arc::new(sandbox_config);
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    for i in 1..=n_workers as u8 {
        workers.spawn(worker(
            i,
            judge_config.clone(),
            sandbox_config.clone(),
            recorder.clone(),
            queue.clone(),
            shutdown_token.clone(),
        ));
    }

    let server = build_server(server_config, service).expect("Failed to build server");

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Stop accepting submissions, letting in-flight requests finish
    server_handle.stop(true).await;

    // 2. Broadcast shutdown signal to workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Err(e)) => log::error!("Worker finished with error: {e:#}"),
            Err(e) if e.is_panic() => log::error!("Worker handle panicked: {:?}", e),
            Err(e) => log::error!("Worker handle finished with error: {:?}", e),
            Ok(Ok(())) => {}
        }
    }

    if recorder.pending_count() > 0 {
        log::warn!(
            "{} judged verdicts were never persisted",
            recorder.pending_count()
        );
    }

    log::info!("Shutdown complete");
    Ok(())
}
