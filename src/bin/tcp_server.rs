use anyhow::Context;
use clap::Parser;
use tracing::info;

use file_bench::{
    cli::ServerArgs,
    common::init_tracing,
    metrics::spawn_reporter,
    server::FileServer,
    storage::Storage,
    workerpool::{build_pool, run_worker_process},
};

fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    init_tracing(&args.log_level);
    let config = args.config();
    let storage = Storage::open(&config.storage_dir)
        .with_context(|| format!("cannot open storage {}", config.storage_dir.display()))?;

    // Process pool child: no runtime, no listener.
    if args.worker {
        return run_worker_process(&storage).context("worker process failed");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot build the tokio runtime")?;
    runtime.block_on(async move {
        let pool = build_pool(config.pool, config.workers, &storage, None)
            .context("cannot start the worker pool")?;
        let mut server = FileServer::from_config(&config, pool);
        let addr = server
            .listen(&config.bind_addr())
            .await
            .with_context(|| format!("cannot listen on {}", config.bind_addr()))?;
        info!("Serving {} on {}", storage.root().display(), addr);
        let reporter = spawn_reporter(server.metrics(), config.report_interval);

        tokio::signal::ctrl_c()
            .await
            .context("cannot wait for the shutdown signal")?;
        info!("Shutting down");
        reporter.abort();
        server.stop().await;
        let snapshot = server.metrics().snapshot();
        info!(
            "[STATUS] Success: {}, Failures: {}",
            snapshot.successes, snapshot.failures
        );
        Ok::<(), anyhow::Error>(())
    })
}
