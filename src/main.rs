//! heapwatch CLI entry point.

use heapwatch_lib::cli::{self, Cli};
use heapwatch_lib::core::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    cli::execute(cli).await
}
