//! # labwire rpctool
//!
//! Command-line access to labwire RPC servers: list targets, list methods,
//! call a method with arguments written in the wire format.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use labwire_codec::{decode, encode};
use labwire_rpc::{inspect, CallArgs, Client, ClientOptions, Error, SslConfig, TargetDescription, TargetSelector};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Call methods of a labwire RPC server
#[derive(Debug, Parser)]
#[command(name = "labwire-rpctool")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server host name or address
    server: String,

    /// Server port
    port: u16,

    /// Mutual TLS: local certificate, local key and the certificate the server must present
    #[arg(long, num_args = 3, value_names = ["LOCAL_CERT", "LOCAL_KEY", "PEER_CERT"])]
    ssl: Option<Vec<PathBuf>>,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = 5.0)]
    timeout: f64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the targets of the server
    #[command(name = "list-targets")]
    ListTargets,

    /// List the methods of a target
    #[command(name = "list-methods")]
    ListMethods {
        /// Target name, required when the server has several
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Call a method and print its result
    #[command(name = "call")]
    Call {
        /// Target name, required when the server has several
        #[arg(short, long)]
        target: Option<String>,

        /// Keyword argument as NAME=VALUE, VALUE in the wire format
        #[arg(short, long = "kwarg", value_name = "NAME=VALUE")]
        kwargs: Vec<String>,

        /// Method name
        method: String,

        /// Positional arguments in the wire format
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

impl Cli {
    fn options(&self, target: Option<&str>) -> Result<ClientOptions> {
        let timeout = Duration::try_from_secs_f64(self.timeout).context("Invalid --timeout")?;
        let mut options = ClientOptions {
            target: target.map_or(TargetSelector::Auto, TargetSelector::from),
            ..ClientOptions::default()
        }
        .with_timeout(timeout);
        if let Some(paths) = &self.ssl {
            let [cert, key, peer] = paths.as_slice() else {
                bail!("--ssl takes exactly three paths");
            };
            options = options.with_ssl(SslConfig::new(cert, key, peer));
        }
        Ok(options)
    }

    fn connect(&self, target: Option<&str>) -> Result<Client> {
        let options = self.options(target)?;
        tracing::debug!(server = %self.server, port = self.port, tls = options.ssl.is_some(), "Connecting");
        Client::connect_with(&self.server, self.port, &options)
            .with_context(|| format!("Cannot connect to {}:{}", self.server, self.port))
    }
}

fn parse_args(args: &[String], kwargs: &[String]) -> Result<CallArgs> {
    let positional = args
        .iter()
        .map(|arg| decode(arg).with_context(|| format!("Invalid argument: {arg}")))
        .collect::<Result<Vec<_>>>()?;
    let mut call_args = CallArgs::positional(positional);
    for kwarg in kwargs {
        let Some((name, value)) = kwarg.split_once('=') else {
            bail!("Keyword argument `{kwarg}` is not NAME=VALUE");
        };
        let value = decode(value).with_context(|| format!("Invalid value for `{name}`"))?;
        call_args = call_args.kwarg(name, value);
    }
    Ok(call_args)
}

fn format_methods(description: &TargetDescription) -> String {
    let mut out = String::new();
    if let Some(doc) = &description.docstring {
        let _ = writeln!(out, "{doc}\n");
    }
    for (name, (signature, doc)) in &description.methods {
        let marker = if description.is_fire_and_forget(name) { " [no reply]" } else { "" };
        let _ = writeln!(out, "{name}{signature}{marker}");
        if let Some(doc) = doc {
            for line in doc.lines() {
                let _ = writeln!(out, "    {line}");
            }
        }
    }
    out
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::ListTargets => {
            let id = inspect(&cli.server, cli.port, &cli.options(None)?)
                .with_context(|| format!("Cannot inspect {}:{}", cli.server, cli.port))?;
            if let Some(description) = &id.description {
                println!("# {description}");
            }
            for target in &id.targets {
                println!("{target}");
            }
        }
        Command::ListMethods { target } => {
            let mut client = cli.connect(target.as_deref())?;
            let description = client.list_methods()?;
            print!("{}", format_methods(&description));
            client.close();
        }
        Command::Call {
            target,
            kwargs,
            method,
            args,
        } => {
            let call_args = parse_args(args, kwargs)?;
            let mut client = cli.connect(target.as_deref())?;
            match client.call(method, call_args) {
                Ok(value) => println!("{}", encode(&value)),
                Err(Error::Remote(remote)) => {
                    for line in &remote.traceback {
                        eprintln!("{line}");
                    }
                    bail!("{}: {}", remote.kind, remote.message);
                }
                Err(e) => return Err(e).with_context(|| format!("Call to `{method}` failed")),
            }
            client.close();
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labwire_codec::Value;
    use std::collections::{BTreeMap, BTreeSet};

    #[test]
    fn command_line_shapes() {
        let cli = Cli::try_parse_from(["labwire-rpctool", "lab1", "7000", "call", "-t", "calc", "add", "1", "-2"])
            .unwrap();
        assert_eq!(cli.server, "lab1");
        let Command::Call { target, method, args, .. } = &cli.command else {
            panic!("expected call");
        };
        assert_eq!(target.as_deref(), Some("calc"));
        assert_eq!(method, "add");
        assert_eq!(args, &["1", "-2"]);

        let cli = Cli::try_parse_from([
            "labwire-rpctool", "--ssl", "c.pem", "k.pem", "p.pem", "lab1", "7000", "list-targets",
        ])
        .unwrap();
        let options = cli.options(None).unwrap();
        assert_eq!(options.ssl, Some(SslConfig::new("c.pem", "k.pem", "p.pem")));
        assert_eq!(options.target, TargetSelector::Auto);

        assert!(Cli::try_parse_from(["labwire-rpctool", "lab1", "7000", "--ssl", "a", "b"]).is_err());
    }

    #[test]
    fn arguments_use_the_wire_grammar() {
        let args = parse_args(
            &["1".to_string(), r#""x""#.to_string(), "[1, 2.5]".to_string()],
            &["scale=3".to_string()],
        )
        .unwrap();
        assert_eq!(args.args[0], Value::from(1));
        assert_eq!(args.args[1], Value::from("x"));
        assert_eq!(args.args[2], Value::List(vec![1.into(), 2.5.into()]));
        assert_eq!(args.kwargs.get("scale"), Some(&Value::from(3)));

        assert!(parse_args(&["unquoted".to_string()], &[]).is_err());
        assert!(parse_args(&[], &["noequals".to_string()]).is_err());
    }

    #[test]
    fn method_listing() {
        let description = TargetDescription {
            docstring: Some("Calculator".to_string()),
            methods: BTreeMap::from([
                ("add".to_string(), ("(a, b)".to_string(), Some("Add.".to_string()))),
                ("reset".to_string(), ("()".to_string(), None)),
            ]),
            fire_and_forget: BTreeSet::from(["reset".to_string()]),
        };
        assert_eq!(
            format_methods(&description),
            "Calculator\n\nadd(a, b)\n    Add.\nreset() [no reply]\n"
        );
    }
}
