use actix_web::web::Data;
use actix_web::{App, HttpServer};
use log::{error, info};
use videoroom::config::Config;
use videoroom::server::Server;
use videoroom::signaling;
use videoroom::throttle::ThrottleCli;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Log filtering follows the DEBUG environment variable.
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("DEBUG", "info")).init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(1);
        }
    };

    let listen_ip = config.http.listen_ip;
    let listen_port = config.http.listen_port;

    let server = match Server::new(config, Box::new(ThrottleCli)).await {
        Ok(server) => server,
        Err(error) => {
            eprintln!("failed to start server: {error}");
            std::process::exit(1);
        }
    };

    server
        .on_new_room(|room| {
            info!("room {} is up", room.id());
        })
        .detach();
    server
        .on_died(|| {
            error!("a mediasoup worker died, shutting down");
            std::process::exit(1);
        })
        .detach();

    info!("listening on {listen_ip}:{listen_port}");

    let server = Data::new(server);
    HttpServer::new(move || {
        App::new()
            .app_data(server.clone())
            .configure(signaling::configure)
    })
    .bind((listen_ip, listen_port))?
    .run()
    .await
}
