use std::io::Write;

use anyhow::Context;
use clap::Parser;

use file_bench::{
    bench::{run_benchmark, run_session},
    cli::ClientArgs,
    common::init_tracing,
    message::Encode,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ClientArgs::parse();

    // Session child: the encoded result is the only thing on stdout.
    if args.session {
        init_tracing("warn");
        let result = run_session(args.operation, &args.file, &args.client_config()).await;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&result.encode())?;
        stdout.flush()?;
        return Ok(());
    }

    init_tracing(&args.log_level);
    let plan = args.plan();
    println!(
        "Starting {} {} workers to {} '{}'...",
        plan.workers, plan.mode, plan.op, plan.filename
    );
    let report = run_benchmark(&plan).await.context("benchmark failed")?;
    for session in &report.sessions {
        println!("{}", session);
    }
    println!();
    println!("{}", report);
    Ok(())
}
