//! Ed25519 keypair generator
//!
//! Produces key material for operators (commit signing) and aggregator
//! nodes (resync signing). Writes `<prefix>.secret` and `<prefix>.public`
//! as hex, or prints both to stdout when no prefix is given. The secret
//! file never belongs in the shared configuration; only the public half
//! goes into `authorized_keys` / `peer_public`.

#![forbid(unsafe_code)]

use std::env;
use std::fs;
use std::io::Write;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let sk = SigningKey::generate(&mut OsRng);
    let secret_hex = hex::encode(sk.to_bytes());
    let public_hex = hex::encode(sk.verifying_key().to_bytes());

    match parse_flag(&args, "--out") {
        Some(prefix) => {
            let secret_path = format!("{prefix}.secret");
            let public_path = format!("{prefix}.public");
            let mut f = fs::File::create(&secret_path)?;
            writeln!(f, "{secret_hex}")?;
            fs::write(&public_path, format!("{public_hex}\n"))?;
            eprintln!("wrote {secret_path} (keep private) and {public_path}");
        }
        None => {
            println!("secret: {secret_hex}");
            println!("public: {public_hex}");
        }
    }
    Ok(())
}
