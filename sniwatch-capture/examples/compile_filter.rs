//! Example: compile a filter expression and dump the program
//!
//! Run with: cargo run --example compile_filter -- "tcp and port 443"

use sniwatch_capture::compile;

fn main() {
    let expression = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let expression = if expression.is_empty() {
        "tcp and port 443".to_string()
    } else {
        expression
    };

    match compile(&expression, 2000) {
        Ok(program) => {
            println!("// {} ({} instructions)", expression, program.len());
            println!("{}", program);
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
