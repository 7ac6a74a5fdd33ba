use super::Parser;

#[derive(Parser, Debug)]
#[command(name = "portcullis", about = "Session credential lifecycle service")]
pub struct Cli {
    /// Settings TOML; defaults to the build-profile file under `settings/`.
    #[arg(long)]
    pub settings: Option<String>,
}
