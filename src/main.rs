//! Line-oriented front end: one expression per line, one result per line.
//!
//! Set `RUST_LOG=exprjit=debug` to see sizing and compile details on stderr.

use std::io::{self, BufRead, Write};
use std::time::Instant;

use clap::Parser;
use tracing::debug;

use exprjit::{evaluate_ast, parse, Config, Error};

#[derive(Parser, Debug)]
#[command(name = "exprjit", about = "Evaluate integer expressions, optionally via a native JIT")]
struct Args {
    /// Use the tree-walking interpreter instead of compiling to native code
    #[arg(long)]
    interpret: bool,

    /// Echo each expression in normalized form before its result
    #[arg(long)]
    show_ast: bool,

    /// Expressions to evaluate; reads stdin line by line when absent
    expressions: Vec<String>,
}

fn run_line(line: &str, config: &Config, show_ast: bool, out: &mut impl Write) -> io::Result<()> {
    let start = Instant::now();
    let ast = match parse(line) {
        Ok(ast) => ast,
        Err(e) => return writeln!(out, "error: {}", Error::from(e)),
    };
    if show_ast {
        writeln!(out, "{ast}")?;
    }
    match evaluate_ast(&ast, config) {
        Ok(value) => writeln!(out, "{value}")?,
        Err(e) => writeln!(out, "error: {e}")?,
    }
    debug!(elapsed_us = start.elapsed().as_micros() as u64, jit = config.jit, "evaluated");
    Ok(())
}

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = if args.interpret { Config::interpreter() } else { Config::new() };

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if !args.expressions.is_empty() {
        for expr in &args.expressions {
            run_line(expr, &config, args.show_ast, &mut out)?;
        }
        return Ok(());
    }

    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        run_line(&line, &config, args.show_ast, &mut out)?;
        out.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(line: &str, config: &Config, show_ast: bool) -> String {
        let mut out = Vec::new();
        run_line(line, config, show_ast, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_show_ast_echoes_then_evaluates() {
        for config in [Config::new(), Config::interpreter()] {
            assert_eq!(run("( 1+2 ) * 3", &config, true), "(1+2)*3\n9\n");
            assert_eq!(run("1+2*3", &config, false), "7\n");
        }
    }

    #[test]
    fn test_errors_are_reported_per_line() {
        let config = Config::new();
        assert_eq!(run("1 2", &config, true), "error: parse error: malformed expression at position 2\n");
        assert_eq!(run("4/(2-2)", &config, true), "4/(2-2)\nerror: evaluation error: division by zero\n");
        assert_eq!(run("6*7", &config, false), "42\n");
    }
}
