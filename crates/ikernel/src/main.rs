//! Kernel binary: wires the calculator front end into a session.

mod calc;

use anyhow::Context;
use ikernel_engine::Shell;
use ikernel_session::{MimeFormatter, Session, SessionOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::calc::{CalcCompiler, CalcParser, CalcRewriter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: ikernel <connection-file>");
        std::process::exit(1);
    };

    let options = SessionOptions::from_file(&path)
        .with_context(|| format!("loading connection file {path}"))?;

    let shell = Shell::new(
        Box::new(CalcParser),
        Box::new(CalcRewriter),
        Box::new(CalcCompiler),
    );
    let mut session = Session::bind(&options, Box::new(shell), Box::new(MimeFormatter))
        .await
        .context("binding session channels")?;
    session.run().await.context("session loop failed")?;
    Ok(())
}
