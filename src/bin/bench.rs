//! The `margay-bench` binary: run the micro workload under the options
//! given by `MARGAY_*` environment variables and print the report.

use anyhow::{Context, Result};
use margay::workload::{MicroClient, MicroConfig};
use margay::{Options, Runtime};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let opts = Options::from_env().context("reading MARGAY_* options")?;
    tracing::info!(
        threads = opts.nr_threads,
        epochs = opts.max_epoch - 1,
        txns_per_epoch = opts.txns_per_epoch,
        priority = opts.priority_enabled(),
        "starting"
    );

    let runtime = Runtime::new(opts).context("building runtime")?;
    let client = MicroClient::new(MicroConfig::default());
    let report = runtime.run(&client);

    println!("{}", report.to_json());
    Ok(())
}
