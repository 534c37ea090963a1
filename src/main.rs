use std::path::PathBuf;

use clap::{error::ErrorKind, CommandFactory, Parser as ClapParser};
use colored::Colorize;

use dyvac::{
    diagnostics::Level,
    frontend::{lexer::Lexer, render::render_module},
    Program,
};

#[derive(Debug, ClapParser)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(short = 'e', value_enum)]
    emit: Option<EmitFormat>,

    source_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EmitFormat {
    #[value(name = "tokens")]
    Tokens,
    #[value(name = "ast")]
    Ast,
    #[value(name = "src")]
    Source,
    #[value(name = "ir")]
    Ir,
}

fn main() {
    let args = Args::parse();

    if args.source_files.is_empty() {
        Args::command()
            .error(ErrorKind::MissingRequiredArgument, "Missing source files!")
            .exit();
    }

    for source_file in &args.source_files {
        if !source_file.exists() {
            Args::command()
                .error(
                    ErrorKind::InvalidValue,
                    format!("Source file '{}' does not exist!", source_file.display()),
                )
                .exit()
        }
    }

    let mut program = Program::new();

    for path in &args.source_files {
        let index = match program.load_file(path, true) {
            Ok(index) => index,
            Err(error) => {
                eprintln!("error: cannot read '{}': {error}", path.display());
                std::process::exit(1);
            }
        };

        let module = &program.modules[index];

        match args.emit {
            Some(EmitFormat::Tokens) => {
                let file = program.sources.get(module.source);
                for token in Lexer::new(file) {
                    println!(
                        "{}..{}\t{}",
                        token.site.start, token.site.end, token.tag
                    );
                }
            }
            Some(EmitFormat::Ast) => {
                println!("{:#?}", module.arena);
            }
            Some(EmitFormat::Source) => {
                let file = program.sources.get(module.source);
                print!(
                    "{}",
                    render_module(&module.arena, &module.roots, file)
                );
            }
            Some(EmitFormat::Ir) => {
                print!("{}", module.ir);
            }
            None => {}
        }
    }

    /* Render accumulated diagnostics in their total order */

    for module in program.modules.iter() {
        for diagnostic in module.diagnostics.sorted(&program.sources) {
            let text = diagnostic.render(&program.sources);
            let text = match diagnostic.level {
                Level::Error => text.red().to_string(),
                Level::Warning => text.yellow().to_string(),
                Level::Note => text,
            };
            eprintln!("{text}");
        }
    }

    if program.contains_error() {
        std::process::exit(1);
    }
}
