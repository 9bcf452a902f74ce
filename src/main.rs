// src/main.rs

use batchdag::errors::BatchdagError;
use batchdag::{cli, exit_code_for, logging, run};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("batchdag error: {err:#}");
            let code = err.downcast_ref::<BatchdagError>().map_or(1, exit_code_for);
            std::process::exit(code);
        }
    }
}

async fn run_main() -> anyhow::Result<i32> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    Ok(run(args).await?)
}
