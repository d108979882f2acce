//! `flowctl validate`: structural + schema validation, no execution.

use std::path::PathBuf;

use crate::loader::load_flow_from_file;
use crate::validation::validate_flow;

#[derive(clap::Args, Debug)]
pub struct ValidateArgs {
    pub flow: PathBuf,
}

pub fn run(args: ValidateArgs) -> anyhow::Result<()> {
    let flow = load_flow_from_file(&args.flow, false)?;
    validate_flow(&flow)?;
    println!("{}: valid ({} steps)", args.flow.display(), flow.steps.len());
    Ok(())
}
