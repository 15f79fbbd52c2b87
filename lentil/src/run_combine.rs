use crate::cli_common::RunArgs;
use clap::Args;
use lentil::combine::combine;
use lentil::common::*;

#[derive(Args, Debug)]
pub struct CombineArgs {
    #[command(flatten)]
    run: RunArgs,

    #[arg(
        short = 'k',
        long = "components",
        value_delimiter = ',',
        num_args = 1..,
        help = "Ranks to combine (default: every planned rank)"
    )]
    components: Vec<usize>,
}

pub fn run_combine(args: &CombineArgs) -> anyhow::Result<()> {
    let ctx = args.run.context()?;
    let ranks = if args.components.is_empty() {
        None
    } else {
        Some(args.components.as_slice())
    };
    let done = combine(&ctx, ranks)?;
    info!("combined K = {:?}", done);
    Ok(())
}
