use std::convert::Infallible;

use clap::Args;

use common::build_info;
use common::version::BuildInfo;

/// Print the version and build metadata of this binary
#[derive(Args, Debug, Clone)]
pub struct Version {
    /// Only print the release version
    #[arg(long)]
    pub short: bool,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Version {
    type Error = Infallible;
    type Output = String;

    async fn execute(&self, _ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        Ok(describe(&build_info!(), self.short))
    }
}

fn describe(info: &BuildInfo, short: bool) -> String {
    let headline = format!("{} {}", env!("CARGO_PKG_NAME"), info.version);
    if short {
        headline
    } else {
        format!("{}\n{}", headline, info)
    }
}
