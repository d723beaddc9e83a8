#![allow(clippy::upper_case_acronyms)]

use std::sync::Arc;

use pingora_core::apps::HttpServerOptions;
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_core::services::listening::Service;

use brinkcdn::admin::{AdminHttpApp, AdminState};
use brinkcdn::cache::{EvictionService, ResponseCache};
use brinkcdn::config::{Config, Tls};
use brinkcdn::engine::ProxyEngine;
use brinkcdn::fileresolve::FileResolver;
use brinkcdn::logging::Logger;
use brinkcdn::route::RouteResolver;
use brinkcdn::transform::TransformPipeline;

fn main() {
    let opt = Opt::parse_args();
    let config = Config::load_yaml_with_opt_override(&opt).expect("failed to load configuration");

    let logger = config.server.log.clone().map(Logger::new);
    match &logger {
        Some(l) => l.init_env_logger(),
        None => env_logger::init(),
    }

    log::info!("building routing and data-plane collaborators...");
    let routes = Arc::new(RouteResolver::new(&config));
    let cache = Arc::new(ResponseCache::new(
        config.cache.max_items,
        config.cache.max_ttl_secs,
        config.cache.check_period_secs,
    ));
    let file_resolver = Arc::new(FileResolver::new(config.file_resolution.clone()));
    let transform = Arc::new(TransformPipeline::new(&config, routes.fronted_hosts()));

    let engine = ProxyEngine::new(&config, routes.clone(), cache.clone(), file_resolver.clone(), transform.clone());

    let mut pingsix_server = Server::new_with_opt_and_conf(Some(opt), config.pingora);

    let mut engine_service = Service::new("cdn engine".to_string(), engine);

    log::info!("adding listeners...");
    for listener in &config.server.listeners {
        match &listener.tls {
            Some(Tls { cert_path, key_path }) => {
                let mut settings = TlsSettings::intermediate(cert_path, key_path).expect("adding TLS listener shouldn't fail");
                if listener.offer_h2 {
                    settings.enable_h2();
                }
                engine_service.add_tls_with_settings(&listener.address.to_string(), None, settings);
            }
            None => {
                if listener.offer_h2c {
                    let mut options = HttpServerOptions::default();
                    options.h2c = true;
                    engine_service.app_logic_mut().unwrap().server_options = Some(options);
                }
                engine_service.add_tcp(&listener.address.to_string());
            }
        }
    }

    let admin_state = AdminState {
        cache: cache.clone(),
        file_resolver: file_resolver.clone(),
        transform: transform.clone(),
    };
    let admin_service = AdminHttpApp::admin_http_service(config.server.admin.clone(), admin_state);

    let eviction_service = EvictionService { cache: cache.clone() };

    log::info!("bootstrapping...");
    pingsix_server.bootstrap();

    log::info!("bootstrapped, adding services...");
    pingsix_server.add_service(engine_service);
    pingsix_server.add_service(admin_service);
    pingsix_server.add_service(eviction_service);
    if let Some(logger) = logger {
        pingsix_server.add_service(logger);
    }

    log::info!("starting server...");
    pingsix_server.run_forever();
}
