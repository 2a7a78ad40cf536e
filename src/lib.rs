/*! FastCGI application side in pure Rust.

Web servers like nginx or Apache forward requests to a FastCGI application.
This crate is that application's end of the connection:
- [`fastcgi`]: Record parsing and construction
- [`params`]: the name-value pairs of FCGI_PARAMS
- [`Server`]: accepts connections, multiplexes their requests and hands
  each ready [`Request`] to the application via [`Incoming`]
- [`Request`]: parameters, STDIN as `AsyncRead`, STDOUT / STDERR as `AsyncWrite`

Only the RESPONDER role is implemented. Management records are ignored.

```no_run
use async_fcgi_server::{Config, Server};
use tokio::io::AsyncWriteExt;

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let (server, mut incoming) = Server::new(Config::default());
    server.bind(&"127.0.0.1:9000".parse().unwrap()).await?;
    while let Some(mut req) = incoming.next().await {
        tokio::spawn(async move {
            let out = req.output_stream();
            if out.write_all(b"Content-Type: text/plain\r\n\r\nHello").await.is_ok() {
                let _ = req.finalize(0);
            }
        });
    }
    Ok(())
}
```
*/
#![cfg_attr(docsrs, feature(doc_cfg))]

mod bufvec;
pub mod codec;
pub mod duplex;
pub mod fastcgi;
pub mod params;
pub mod request;
pub mod server;
pub mod stream;

pub use request::Request;
pub use server::{Config, Incoming, Server};
pub use stream::FCGIAddr;
