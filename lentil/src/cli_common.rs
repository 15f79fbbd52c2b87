use clap::Args;
use lentil::run_context::RunContext;

/// Where a run keeps its files
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(
        long,
        default_value = ".",
        help = "Output directory",
        long_help = "Output directory.\n\
		     Everything of a run goes to {out_dir}/{name}/ and\n\
		     intermediate files to {out_dir}/{name}/cnmf_tmp/"
    )]
    pub out_dir: Box<str>,

    #[arg(long, required = true, help = "Name of this run")]
    pub name: Box<str>,
}

impl RunArgs {
    pub fn context(&self) -> anyhow::Result<RunContext> {
        RunContext::new(&self.out_dir, &self.name)
    }
}
