//! FastCGI application on 127.0.0.1:9000 that answers with the parameters it received.
//! Point a web server at it, e.g. nginx:
//! ```text
//! location / {
//!     include fastcgi_params;
//!     fastcgi_pass 127.0.0.1:9000;
//! }
//! ```
//! Pass a unix socket path as first argument to listen there instead.

#![deny(warnings)]
use async_fcgi_server::{Config, FCGIAddr, Request, Server};
use log::{error, info};
use std::io::Write;

fn answer(mut req: Request) -> std::io::Result<()> {
    let mut names: Vec<&str> = req.param_names().collect();
    names.sort_unstable();
    let mut page = Vec::new();
    writeln!(page, "Content-Type: text/plain")?;
    writeln!(page)?;
    writeln!(page, "Hello from request #{} on connection {}", req.get_id(), req.connection_id())?;
    writeln!(page, "This is what I received:")?;
    for name in names {
        writeln!(page, "{}: {}", name, req.get_param(name).unwrap_or_default())?;
    }
    req.output_stream().write_all(&page)?;
    req.finalize(0)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    pretty_env_logger::init();

    let addr: FCGIAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9000".to_string())
        .parse()
        .expect("FCGIAddr");
    let (server, mut incoming) = Server::new(Config::default());
    let bound = server.bind(&addr).await.expect("bind");
    info!("listening on {}", bound);

    while let Some(req) = incoming.next().await {
        if let Err(e) = answer(req) {
            error!("{}", e);
        }
    }
}
