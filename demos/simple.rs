use std::sync::Arc;

use edge_experiments::{ClientConfig, ExperimentHook, FileStorage, PollerThreadConfig};

pub fn main() -> edge_experiments::Result<()> {
    // Configure env_logger to see experiment logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("edge_experiments"))
        .init();

    let base_url =
        std::env::var("EXPERIMENTS_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_owned());
    let client = ClientConfig::from_base_url(base_url)
        .storage(Arc::new(FileStorage::open(".visitor.json")))
        .sink(|event: &str, data: &serde_json::Value| {
            println!("Analytics event {}: {}", event, data);
        })
        .to_client()?;

    // Start a poller thread to keep experiments fresh.
    let poller = client.start_poller_thread(PollerThreadConfig::new())?;

    // Block waiting for the first fetch. If the server is down, the fallback list is used.
    match poller.wait_for_experiments() {
        Ok(source) => println!("Experiments loaded from {}", source),
        Err(err) => println!("error requesting experiments: {:?}", err),
    }

    let mut defaults = serde_json::Map::new();
    defaults.insert("ctaText".to_owned(), "Download Resume".into());

    let mut hook = ExperimentHook::new("hero-cta-test", defaults);
    hook.resolve(&client);

    println!("Visitor: {}", client.get_user_id());
    println!("Variant: {:?}", hook.variant_id());
    println!("CTA text: {}", hook.config()["ctaText"]);

    for (experiment_id, variant) in client.get_assignments() {
        println!("Assigned {} -> {}", experiment_id, variant.id);
    }

    hook.track_conversion(&client, Some("resume_download"), None);

    poller.shutdown()
}
