use log::{debug, info};
use servlet_core::{
    resource_fn, Properties, Request, Response, Server, ServerConfig, ServerError, ServerResult,
    Status,
};
use std::env;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

const INDEX: &str = r#"<html><head><title>servlet-core</title></head><body>
<h1>servlet-core</h1>
<form method="post" action="/upload" enctype="multipart/form-data">
<input type="text" name="comment"><input type="file" name="file"><input type="submit">
</form>
</body></html>
"#;

/// Demo resource: index page, upload report and session counter
fn handle(request: &mut Request, response: &mut Response<'_>) -> ServerResult<()> {
    match request.location() {
        "" => response.send_body(INDEX.as_bytes()),
        "upload" => {
            let mut body = String::from("<html><body><ul>\n");
            for (field, upload) in request.uploads() {
                body.push_str(&format!(
                    "<li>{}: {} ({} bytes, {:?})</li>\n",
                    field,
                    upload.filename(),
                    upload.size(),
                    upload.status()
                ));
            }
            if let Some(comment) = request.body_param("comment") {
                body.push_str(&format!("<li>comment: {}</li>\n", comment));
            }
            body.push_str("</ul></body></html>\n");
            response.send_body(body.as_bytes())
        }
        "counter" => {
            let hits = request.session().map(|s| s.hits()).unwrap_or(0);
            response.set_content_type("text/plain")?;
            let body = format!("{} requests in this session\n", hits);
            response.set_content_length(body.len() as u64)?;
            response.write_all(body.as_bytes())?;
            Ok(())
        }
        "old" => response.redirect("/"),
        _ => Err(ServerError::Status(Status::NotFound)),
    }
}

fn main() -> ServerResult<()> {
    env_logger::init();

    // Parse command-line arguments
    let args: Vec<String> = env::args().collect();
    let config = match args.get(1) {
        Some(path) if Path::new(path).exists() => {
            ServerConfig::from_source(&Properties::from_json_file(path)?)
        }
        _ => ServerConfig::new(),
    };
    debug!("Effective configuration: {}", serde_json::to_string(&config)?);

    let server = Server::bind(config, Arc::new(resource_fn(handle)))?;

    // Set up a signal handler for graceful shutdown
    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal. Stopping server...");
        shutdown.shutdown();
    })
    .map_err(|e| ServerError::Config(format!("cannot install signal handler: {}", e)))?;

    server.run()
}
