use shipyard::cli::{Args, Commands, ConfigDiscovery, print_summary};
use shipyard::{Deployer, DockerRuntime, HostRunner, ManagedPaths};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shipyard=info".into()),
        )
        .init();

    let args = <Args as clap::Parser>::parse();
    match args.command {
        Commands::Deploy(deploy) => {
            let code = run_deploy(deploy).await;
            std::process::exit(code);
        }
        Commands::ShowConfig => ConfigDiscovery::show_discovery_info(),
    }
}

async fn run_deploy(args: shipyard::cli::DeployArgs) -> i32 {
    let json = args.json;
    let defaults = ConfigDiscovery::discover();
    let request = match args.into_request(&defaults) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("Error: {e}");
            return 2;
        }
    };

    info!(service = %request.service_name, "starting shipyard deployment");

    let runner = HostRunner::new();
    let runtime = DockerRuntime::new();
    let paths = ManagedPaths::with_base_dir(&request.base_dir);
    let deployer = Deployer::new(&runner, &runtime, paths);

    match deployer.deploy(request.clone()).await {
        Ok(result) => {
            if json {
                match serde_json::to_string_pretty(&result) {
                    Ok(rendered) => println!("{rendered}"),
                    Err(e) => {
                        error!("failed to serialize result: {e}");
                        return 1;
                    }
                }
            } else {
                print_summary(&request, &result);
            }
            0
        }
        Err(e) => {
            error!(kind = e.kind(), "deployment failed: {e}");
            if e.transient_exhausted() {
                eprintln!("Transient registry/network failures exhausted the retry budget; retry later.");
            }
            eprintln!("Error ({}): {e}", e.kind());
            match e.kind() {
                "invalid-request" => 2,
                "source-invalid" => 2,
                "bootstrap-failed" => 3,
                "deployment-failed" => 4,
                "invalid-access-configuration" => 5,
                _ => 1,
            }
        }
    }
}
