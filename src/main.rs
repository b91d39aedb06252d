use anyhow::{bail, Context, Result};
use tftp_client::TftpClient;

const USAGE: &str = "usage: tftp-client get <server> <remote> [local]\n       tftp-client put <server> <local> [remote]";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    run(std::env::args().skip(1).collect()).await
}

async fn run(args: Vec<String>) -> Result<()> {
    let (command, server, first, second) = match args.as_slice() {
        [command, server, first] => (command, server, first, first),
        [command, server, first, second] => (command, server, first, second),
        _ => bail!("{USAGE}"),
    };

    let client = TftpClient::new(server.as_str());
    match command.as_str() {
        "get" => client
            .download(first, second)
            .await
            .with_context(|| format!("Download of {first} from {server} failed")),
        "put" => client
            .upload(first, second)
            .await
            .with_context(|| format!("Upload of {first} to {server} failed")),
        other => bail!("Unknown command '{other}'\n{USAGE}"),
    }
}
