use tracing::info;

use dlserve::config::Config;
use dlserve::web::start_web_server;
use dlserve::{init_tracing, nodes};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_tracing();

    for node in nodes::registrations() {
        info!("registered node {} ({})", node.id, node.display_name);
    }

    start_web_server(Config::from_env()).await
}
