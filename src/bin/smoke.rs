//! Run a composition end to end against stubbed actions.
//!
//! Stubs are inline expressions evaluated with the invocation params bound
//! as `params`; a stub with no result echoes its input.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use baton::{action, run_source, ActionCallable, AstNode, EvalValue, InvokeError, LocalPlatform, Scope};

#[derive(Parser)]
#[command(
    name = "baton-smoke",
    about = "Run a composition locally with stubbed actions"
)]
struct Args {
    /// Composition JSON file
    composition: PathBuf,

    /// Input params as inline JSON
    #[arg(long, default_value = "{}")]
    params: String,

    /// JSON file mapping action names to inline-expression stubs
    #[arg(long)]
    actions: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let source = std::fs::read_to_string(&args.composition)
        .with_context(|| format!("failed to read {}", args.composition.display()))?;
    let composition =
        AstNode::from_value(serde_json::from_str(&source).context("invalid composition JSON")?)
            .context("unrecognized composition shape")?;

    let params: Value = serde_json::from_str(&args.params).context("invalid --params JSON")?;

    let mut actions: HashMap<String, ActionCallable> = HashMap::new();
    if let Some(path) = &args.actions {
        let stubs: HashMap<String, String> = serde_json::from_str(
            &std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        )
        .context("invalid action stub file")?;
        for (name, code) in stubs {
            actions.insert(name.clone(), stub(name, code));
        }
    }

    let platform = LocalPlatform::new(&composition, actions).context("composition rejected")?;
    let result = platform.run(params).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn stub(name: String, code: String) -> ActionCallable {
    action(move |params| {
        let mut scope = Scope::from([("params".to_owned(), params.clone())]);
        match run_source(&code, &mut scope) {
            Ok(EvalValue::Json(value)) => Ok(value),
            Ok(_) => Ok(params),
            Err(err) => Err(InvokeError::new(
                "StubError",
                format!("stub '{name}' failed: {err}"),
            )),
        }
    })
}
