//! q2p REPL - build or load a model and query it interactively.

use candle_core::Device;
use q2p::{default_device, parse_query, ForwardContext, Q2PConfig, StructuredQuery, Q2P};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::env;
use tracing_subscriber::EnvFilter;

/// REPL state carried between lines.
struct Session {
    device: Device,
    model: Option<Q2P>,
    top_k: usize,
    last_query: Option<StructuredQuery>,
}

impl Session {
    fn new(device: Device) -> Self {
        Self {
            device,
            model: None,
            top_k: 10,
            last_query: None,
        }
    }

    fn model(&self) -> Option<&Q2P> {
        if self.model.is_none() {
            println!("No model. Use :new or :load first.");
        }
        self.model.as_ref()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let mut session = Session::new(default_device());

    // Optional model directory argument
    if args.len() > 1 {
        let dir = &args[1];
        match Q2P::load(dir, &session.device) {
            Ok(model) => {
                println!("Loaded model from {}", dir);
                session.model = Some(model);
            }
            Err(e) => {
                eprintln!("Error loading {}: {}", dir, e);
                std::process::exit(1);
            }
        }
    }

    println!("q2p v{} - query answering with particle embeddings", env!("CARGO_PKG_VERSION"));
    println!("Type :help for commands, :quit to exit\n");

    run_repl(session)
}

fn run_repl(mut session: Session) -> Result<(), Box<dyn std::error::Error>> {
    let mut rl = DefaultEditor::new()?;

    loop {
        match rl.readline("q2p> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(trimmed);

                if trimmed.starts_with(':') {
                    if !handle_command(trimmed, &mut session) {
                        break;
                    }
                } else {
                    handle_query(trimmed, &mut session);
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Bye!");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

/// Handle REPL commands (starting with :)
/// Returns false if REPL should exit
fn handle_command(cmd: &str, session: &mut Session) -> bool {
    let parts: Vec<&str> = cmd.split_whitespace().collect();
    let command = parts[0];

    match command {
        ":quit" | ":q" | ":exit" => {
            println!("Bye!");
            return false;
        }

        ":help" | ":h" | ":?" => {
            print_help();
        }

        ":new" => {
            // :new <entities> <relations> <dim> [particles]
            let sizes: Result<Vec<usize>, _> = parts[1..].iter().map(|p| p.parse()).collect();
            match sizes.as_deref() {
                Ok([e, r, d]) => new_model(session, Q2PConfig::new(*e, *r, *d)),
                Ok([e, r, d, p]) => {
                    new_model(session, Q2PConfig::new(*e, *r, *d).with_particles(*p))
                }
                _ => println!("Usage: :new <entities> <relations> <dim> [particles]"),
            }
        }

        ":load" | ":l" => {
            if parts.len() < 2 {
                println!("Usage: :load <dir>");
            } else {
                match Q2P::load(parts[1], &session.device) {
                    Ok(model) => {
                        println!(
                            "Loaded {} parameter tensors from {}",
                            model.params().len(),
                            parts[1]
                        );
                        session.model = Some(model);
                    }
                    Err(e) => println!("Error loading model: {}", e),
                }
            }
        }

        ":save" => {
            if parts.len() < 2 {
                println!("Usage: :save <dir>");
            } else if let Some(model) = session.model() {
                match model.save(parts[1]) {
                    Ok(()) => println!("Saved model to {}", parts[1]),
                    Err(e) => println!("Error saving model: {}", e),
                }
            }
        }

        ":params" | ":p" => {
            if let Some(model) = session.model() {
                for (name, shape) in model.params().shapes() {
                    println!("  {:<40} {:?}", name, shape);
                }
                println!(
                    "{} tensors, {} parameters",
                    model.params().len(),
                    model.params().num_elements()
                );
            }
        }

        ":topk" | ":k" => match parts.get(1).map(|p| p.parse::<usize>()) {
            Some(Ok(k)) if k > 0 => {
                session.top_k = k;
                println!("top-k = {}", k);
            }
            _ => println!("Usage: :topk <k>  (currently {})", session.top_k),
        },

        ":loss" => {
            let labels: Result<Vec<usize>, _> = parts[1..].iter().map(|p| p.parse()).collect();
            let Ok(labels) = labels else {
                println!("Usage: :loss <gold entity per batch element...>");
                return true;
            };
            let Some(query) = session.last_query.as_ref() else {
                println!("No query yet. Enter a query literal first.");
                return true;
            };
            if let Some(model) = session.model() {
                let loss = model
                    .loss(query, &labels, &mut ForwardContext::eval())
                    .and_then(|t| Ok(t.to_scalar::<f32>()?));
                match loss {
                    Ok(v) => println!("loss = {:.6}", v),
                    Err(e) => println!("Error: {}", e),
                }
            }
        }

        ":structure" | ":s" => match session.last_query.as_ref() {
            Some(q) => println!("{}  depth {}", q.structure(), q.depth()),
            None => println!("No query yet."),
        },

        _ => {
            println!("Unknown command: {}. Type :help for help.", command);
        }
    }

    true
}

fn new_model(session: &mut Session, config: Q2PConfig) {
    match Q2P::new(config, &session.device) {
        Ok(model) => {
            println!(
                "New model: {} entities, {} relations, dim {}, {} particles ({} parameters)",
                model.config().num_entities,
                model.config().num_relations,
                model.config().embedding_dim,
                model.config().num_particles,
                model.params().num_elements()
            );
            session.model = Some(model);
        }
        Err(e) => println!("Error: {}", e),
    }
}

/// Parse a query literal and print its top-k answers per batch element.
fn handle_query(input: &str, session: &mut Session) {
    let query = match parse_query(input) {
        Ok(q) => q,
        Err(e) => {
            println!("Error: {}", e);
            return;
        }
    };

    if let Some(model) = session.model() {
        match model.top_k(&query, session.top_k) {
            Ok(batches) => {
                for (b, answers) in batches.iter().enumerate() {
                    let ranked: Vec<String> = answers
                        .iter()
                        .map(|(entity, score)| format!("{}:{:.3}", entity, score))
                        .collect();
                    println!("[{}] {}", b, ranked.join("  "));
                }
            }
            Err(e) => println!("Error: {}", e),
        }
    }
    session.last_query = Some(query);
}

fn print_help() {
    println!(
        r#"q2p Commands:
  :help, :h, :?                 Show this help
  :quit, :q                     Exit the REPL
  :new <E> <R> <dim> [P]        Build a fresh model (P particles, default 5)
  :load, :l <dir>               Load config.json + model.safetensors
  :save <dir>                   Save config.json + model.safetensors
  :params, :p                   List parameter names and shapes
  :topk, :k <k>                 Number of answers to print
  :loss <gold...>               Loss of the last query, one gold id per batch element
  :structure, :s                Structure of the last query

Queries:
  ("e", [[3]])                          Anchor entity 3
  ("p", [5], ("e", [[3]]))              Entities related by 5 to entity 3
  ("p", [5, 5], ("e", [[3], [7]]))      Batch of two
  ("i", q1, q2, ...)                    Intersection
  ("u", q1, q2, ...)                    Union
  ("n", q)                              Negation
  JSON arrays work too: ["p", [5], ["e", [[3]]]]

Command line:
  q2p                           Start interactive REPL
  q2p <dir>                     Load a saved model, then start REPL
  RUST_LOG=q2p=debug q2p        Trace every interpreted query node
"#
    );
}
