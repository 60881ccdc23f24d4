use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("fdpay {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: fdpay");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("FDPAY_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "max_fds_per_message: {}",
        fdpay_transport::MAX_FDS_PER_MESSAGE
    );
    println!(
        "features: lend={}, async={}, cli=true",
        cfg!(feature = "lend"),
        cfg!(feature = "async")
    );

    Ok(SUCCESS)
}
