#![forbid(unsafe_code)]
//! Prints a fresh secp256k1 key pair and its NetherChain address.

use colored::*;
use netherchain::crypto::KeyPair;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let keypair = KeyPair::generate()?;
    println!("{} {}", "Address:    ".bright_green().bold(), keypair.address());
    println!("{} {}", "Public key: ".bright_white(), hex::encode(keypair.public_key_bytes()));
    println!("{} {}", "Secret key: ".bright_red(), keypair.secret_hex());
    println!();
    println!("{}", "Keep the secret key private; it is not stored anywhere.".yellow());
    Ok(())
}
