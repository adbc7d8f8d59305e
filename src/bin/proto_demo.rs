//! Encodes a `Person`, prints the wire bytes as base64, then decodes them
//! and prints the result as Rust debug output and as JSON.

use std::collections::HashMap;
use std::time::SystemTime;

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use delivery_rpc::proto::person::ContactMethod;
use delivery_rpc::proto::{Package, Person};
use prost::Message;

fn main() -> Result<()> {
    let person = Person {
        name: "Nikita".to_string(),
        address: "Kyiv".to_string(),
        contact_method: Some(ContactMethod::TelegramHandle("@aboba".to_string())),
        created_at: Some(SystemTime::now().into()),
        packages: vec![Package {
            id: 1,
            description: "Smartphone".to_string(),
            weight_kg: 0.5,
            fragile_note: None,
            estimated_delivery_duration: Some(prost_types::Duration {
                seconds: 48 * 3600,
                nanos: 0,
            }),
        }],
        metadata: HashMap::from([
            ("priority".to_string(), "high".to_string()),
            ("source".to_string(), "mobile_app".to_string()),
        ]),
    };

    let data = person.encode_to_vec();
    println!("Encoded ({} bytes, base64): {}", data.len(), STANDARD.encode(&data));

    let decoded = Person::decode(data.as_slice())?;
    match &decoded.contact_method {
        Some(ContactMethod::TelegramHandle(handle)) => println!("Telegram: {handle}"),
        Some(ContactMethod::WhatsappNumber(number)) => println!("WhatsApp: {number}"),
        None => println!("No contact method provided"),
    }
    println!("{decoded:#?}");
    println!("{}", serde_json::to_string_pretty(&decoded)?);
    Ok(())
}
