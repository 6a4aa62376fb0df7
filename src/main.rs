use std::process;

use rhttpd::config;
use rhttpd::server::Server;

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .unwrap_or_else(|| config::DEFAULT_CONFIG_FILE.to_string());
    if args.next().is_some() {
        eprintln!("usage: rhttpd [config-file]");
        process::exit(1);
    }

    let cfg = match config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            process::exit(1);
        }
    };

    let mut server = match Server::new(cfg) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("startup error: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = server.bind() {
        eprintln!("startup error: {e}");
        process::exit(1);
    }
    server.run();
}
