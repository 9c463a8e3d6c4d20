//! CLI tool to run a stored template against a saved screenshot.
//! Usage: cargo run --bin match_template --features cli -- <template.sst> <screenshot.png>

use std::path::PathBuf;

use spotter_vision::{codec, find_all_matches, find_match, MatchConfig};

fn main() {
    // Initialize tracing for debug output
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <template> <screenshot.png>", args[0]);
        std::process::exit(1);
    }

    let template_path = PathBuf::from(&args[1]);
    let screenshot_path = PathBuf::from(&args[2]);

    println!("Loading template: {}", template_path.display());
    let template = codec::load_template(&template_path).expect("Failed to load template");
    let (cx, cy) = template.center();
    println!(
        "Template {}x{}, anchor ({cx}, {cy}), radius {}, threshold {}",
        template.image().width(),
        template.image().height(),
        template.radius(),
        template.match_threshold(),
    );

    println!("Loading screenshot: {}", screenshot_path.display());
    let screen = image::open(&screenshot_path)
        .expect("Failed to open screenshot")
        .to_rgba8();
    println!("Screenshot size: {}x{}", screen.width(), screen.height());

    let config = MatchConfig::default();

    println!("\n=== Best Match ===");
    let result = find_match(&screen, &template, &config);
    if result.found {
        let (x, y) = result.coordinates.expect("found result carries coordinates");
        println!("Found at ({x}, {y}) with confidence {:.3}", result.confidence);
    } else {
        println!("No match (best score {:.3})", result.confidence);
    }

    println!("\n=== All Matches ===");
    let all = find_all_matches(&screen, &template, &config);
    if all.is_empty() {
        println!("No candidates above threshold");
    }
    for (i, m) in all.iter().enumerate() {
        let (x, y) = m.coordinates.unwrap_or((0, 0));
        println!("  {i}: ({x}, {y}) confidence {:.3}", m.confidence);
    }
}
