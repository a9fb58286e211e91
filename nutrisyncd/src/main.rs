use nutrisyncd::daemon::{DaemonConfig, DaemonRuntime};
use nutrisyncd::logging::init_logging;

const USAGE: &str = "\
Usage: nutrisyncd [--login <user-id> [--email <email>] | --logout | --status]
  (no flags)            Run the background service
  --login <user-id>     Record the signed-in account
  --email <email>       Account email used to look up the backend user id
  --logout              Forget the signed-in account
  --status              Print queue and account state and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Login {
        user_id: String,
        email: Option<String>,
    },
    Logout,
    Status,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    let mut email = None;
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--login" => {
                let user_id = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--login requires a user id"))?;
                mode = CliMode::Login {
                    user_id,
                    email: None,
                };
            }
            "--email" => {
                email = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("--email requires a value"))?,
                );
            }
            "--logout" => mode = CliMode::Logout,
            "--status" => mode = CliMode::Status,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    match mode {
        CliMode::Login { user_id, .. } => Ok(CliMode::Login { user_id, email }),
        _ if email.is_some() => anyhow::bail!("--email is only valid with --login"),
        mode => Ok(mode),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Login { user_id, email } => {
            daemon.identity().set_user(&user_id, email.as_deref()).await?;
            println!("signed in as {user_id}");
            Ok(())
        }
        CliMode::Logout => {
            daemon.identity().clear_user().await?;
            println!("signed out");
            Ok(())
        }
        CliMode::Status => {
            println!("{}", daemon.status().await?);
            Ok(())
        }
        CliMode::Run | CliMode::Help => daemon.run().await,
    }
}
