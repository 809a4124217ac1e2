// Demo driver: feeds a structured payload (from a file or the built-in
// fixture) or sample OCR observations through the scan pipeline and prints
// a field report.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};

use veriscan::models::BoundingBox;
use veriscan::{
    NormalizedRecord, RawInput, ScanConfig, ScanMode, ScanOrchestrator, TextObservation,
};

#[derive(Parser)]
#[command(
    name = "scan_demo",
    about = "Run the identity-document scan pipeline against a payload or sample observations"
)]
struct Args {
    /// File containing a decoded structured payload.
    #[arg(long)]
    payload_file: Option<PathBuf>,

    /// Inline structured payload.
    #[arg(long, conflicts_with = "payload_file")]
    payload: Option<String>,

    /// JSON scan configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the structured-parse deadline, in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long, value_enum, default_value = "auto")]
    mode: Mode,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Auto,
    Structured,
    FreeText,
}

impl From<Mode> for ScanMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Auto => ScanMode::Auto,
            Mode::Structured => ScanMode::Structured,
            Mode::FreeText => ScanMode::FreeText,
        }
    }
}

fn sample_payload() -> String {
    let subfile = "DLDAQD1234567\nDCSDOE\nDACJOHN\nDADQUINCY\nDBB01151990\nDBD06012020\n\
                   DBA06012028\nDBC1\nDAU069 in\nDAW185\nDAYBRO\nDAZBLK\nDAG123 MAIN ST\n\
                   DAISACRAMENTO\nDAJCA\nDAK95814\nDCGUSA\nDCAC\nDDK1\r";
    format!("@\n\x1e\rANSI 636014090001DL00410278{}", subfile)
}

fn sample_observations() -> Vec<TextObservation> {
    let lines = [
        "CALIFORNIA DRIVER LICENSE",
        "DL D1234567",
        "LN DOE",
        "FN JOHN",
        "123 MAIN ST",
        "SACRAMENTO, CA 95814",
        "DOB 01/15/1990",
        "EXP 06/01/2028",
        "SEX M HGT 5'-09\" EYES BRO",
        "DONOR",
    ];
    lines
        .iter()
        .enumerate()
        .map(|(i, text)| TextObservation {
            text: (*text).to_string(),
            confidence: 0.92,
            bounds: BoundingBox {
                x: 0.1,
                y: 0.05 + i as f64 * 0.09,
                width: 0.8,
                height: 0.04,
            },
        })
        .collect()
}

fn print_report(record: &NormalizedRecord) {
    println!("\n===============================================");
    println!("           SCAN RESULT FIELD REPORT");
    println!("===============================================\n");
    println!("  First Name:      {:?}", record.first_name);
    println!("  Middle Name:     {:?}", record.middle_name);
    println!("  Last Name:       {:?}", record.last_name);
    println!("  Suffix:          {:?}", record.name_suffix);
    println!("  Date of Birth:   {:?}", record.date_of_birth);
    println!("  Issue Date:      {:?}", record.issue_date);
    println!("  Expiry Date:     {:?}", record.expiry_date);
    println!("  Sex:             {:?}", record.sex);
    println!("  Height (cm):     {:?}", record.height_cm);
    println!("  Weight (kg):     {:?}", record.weight_kg);
    println!("  Eyes / Hair:     {:?} / {:?}", record.eye_color, record.hair_color);
    println!("  Street:          {:?}", record.street);
    println!("  City:            {:?}", record.city);
    println!("  Region:          {:?}", record.region);
    println!("  Postal Code:     {:?}", record.postal_code);
    println!("  Country:         {:?}", record.country);
    println!("  Document Number: {:?}", record.document_number);
    println!("  Document Class:  {:?}", record.document_class);
    println!("  Restrictions:    {:?}", record.restriction_codes);
    println!("  Endorsements:    {:?}", record.endorsement_codes);
    println!("  Issuing Region:  {:?}", record.issuing_region);
    println!(
        "  Donor / Veteran: {:?} / {:?}",
        record.organ_donor, record.veteran
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut config: ScanConfig = match &args.config {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
        None => ScanConfig::default(),
    };
    if let Some(timeout_ms) = args.timeout_ms {
        config.structured_timeout_ms = timeout_ms;
    }
    let mode: ScanMode = args.mode.into();

    let payload = match (&args.payload, &args.payload_file) {
        (Some(inline), _) => Some(inline.clone()),
        (None, Some(path)) => Some(fs::read_to_string(path)?),
        (None, None) => None,
    };

    let input = match (payload, mode) {
        (Some(payload), _) => RawInput::StructuredPayload(payload),
        (None, ScanMode::FreeText) => RawInput::Observations(sample_observations()),
        // No payload given: demo the structured path with the fixture.
        (None, _) => RawInput::StructuredPayload(sample_payload()),
    };

    let orchestrator = Arc::new(ScanOrchestrator::new(config));
    if let Some(mut events) = orchestrator.subscribe() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match serde_json::to_string(&event) {
                    Ok(json) => println!("event: {json}"),
                    Err(e) => eprintln!("event serialization failed: {e}"),
                }
            }
        });
    }

    // Simulate the capture layer feeding an observation batch so an
    // auto-mode fallback has something to read.
    orchestrator.push_observations(sample_observations());

    match orchestrator.scan(input, mode).await {
        Ok(record) => {
            print_report(&record);
            Ok(())
        }
        Err(error) => {
            eprintln!(
                "scan failed [{}]: {} (recoverable: {})",
                error.code(),
                error,
                error.recoverable()
            );
            std::process::exit(1);
        }
    }
}
