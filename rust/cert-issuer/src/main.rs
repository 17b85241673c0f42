use std::sync::Arc;

use anyhow::bail;
use clap::{crate_description, crate_version, Parser};
use stackable_cert_issuer::{
    config::IssuerConfig, controller::CsrController, identity::Identity,
    secret_store::KubeSecretStore, signing_authority::KubeSigningAuthority,
    trust_roots::FileTrustedRoots,
};
use stackable_operator::logging::TracingTarget;

pub const APP_NAME: &str = "cert-issuer";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Make sure that a valid certificate is stored for an instance, requesting one if required
    Issue(IssueRun),
    /// Check whether a stored credential is still usable, fails if it is not
    Check(CheckRun),
}

#[derive(clap::Args)]
struct IssueRun {
    #[arg(long, env)]
    namespace: String,
    /// Name of the instance the certificate is issued for, such as a `Pod` name
    #[arg(long, env)]
    instance: String,
    #[arg(long, env)]
    common_name: String,
    /// Subject alternative DNS name, may be repeated
    #[arg(long = "dns-name")]
    dns_names: Vec<String>,
    /// Subject alternative IP address, may be repeated
    #[arg(long = "ip-address")]
    ip_addresses: Vec<String>,
    #[arg(long, env, default_value = "")]
    component: String,
    /// Appended to the instance name to form the names of the request and the credential
    #[arg(long, env, default_value = "")]
    suffix: String,
    #[command(flatten)]
    config: IssuerConfig,
    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

#[derive(clap::Args)]
struct CheckRun {
    #[arg(long, env)]
    namespace: String,
    /// Name of the credential `Secret`
    #[arg(long)]
    name: String,
    #[command(flatten)]
    config: IssuerConfig,
    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

fn startup(tracing_target: TracingTarget) {
    stackable_operator::logging::initialize_logging("CERT_ISSUER_LOG", APP_NAME, tracing_target);
    stackable_operator::utils::print_startup_string(
        crate_description!(),
        crate_version!(),
        built_info::GIT_VERSION,
        built_info::TARGET.unwrap_or("unknown target"),
        built_info::BUILT_TIME_UTC,
        built_info::RUSTC_VERSION,
    );
}

async fn controller(config: IssuerConfig) -> anyhow::Result<CsrController> {
    let client =
        stackable_operator::client::create_client(Some("cert-issuer.stackable.tech".to_string()))
            .await?;
    Ok(CsrController::new(
        Arc::new(KubeSecretStore::new(&client)),
        Arc::new(KubeSigningAuthority::new(&client)),
        Arc::new(FileTrustedRoots::new(&config.trusted_roots)),
        config,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Issue(IssueRun {
            namespace,
            instance,
            common_name,
            dns_names,
            ip_addresses,
            component,
            suffix,
            config,
            tracing_target,
        }) => {
            startup(tracing_target);
            let identity = Identity {
                namespace,
                instance,
                component,
                suffix,
                common_name,
                dns_names,
                ip_addresses,
            };
            if let Err(err) = controller(config).await?.ensure_certificate(&identity).await {
                tracing::error!(
                    error.category = err.category(),
                    error = %stackable_cert_issuer::utils::error_full_message(&err),
                    "Failed to issue certificate"
                );
                return Err(err.into());
            }
        }
        Command::Check(CheckRun {
            namespace,
            name,
            config,
            tracing_target,
        }) => {
            startup(tracing_target);
            if !controller(config).await?.check_secret(&namespace, &name).await {
                bail!("{namespace}/{name} does not hold a usable credential");
            }
        }
    }
    Ok(())
}
