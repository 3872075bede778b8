use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("udpconn {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: udpconn");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "build_target: {}",
        option_env!("UDPCONN_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "build_profile: {}",
        option_env!("UDPCONN_BUILD_PROFILE").unwrap_or("unknown")
    );
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!(
        "max_datagram_default: {}",
        udpconn_transport::DEFAULT_MAX_DATAGRAM
    );

    Ok(SUCCESS)
}
