/// Put all the modules together: train the benzene model, or serve predictions from it.
use std::error::Error;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod capping;
mod config;
mod error;
mod features;
mod forest;
mod io;
mod model;
mod preprocess;
mod serving;
mod split;
mod temporal;

use capping::OutlierCapper;
use config::{ModelKind, PipelineConfig};
use model::{Evaluation, ModelArtifact};
use preprocess::RawRecord;
use serving::{Prediction, PredictionService, ServingPayload};

#[derive(Parser, Debug)]
#[command(author, version, about = "Predict benzene concentration from gas-sensor readings")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Clean, split, cap and fit; writes one model artifact
    Train {
        /// Raw semicolon-delimited export
        #[arg(long)]
        data: Option<String>,
        #[arg(long)]
        artifact: Option<String>,
        /// JSON file with any subset of the pipeline settings
        #[arg(long)]
        config: Option<PathBuf>,
        /// Seed for both the split and the ensemble
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        trees: Option<usize>,
        #[arg(long, value_enum)]
        model: Option<ModelKind>,
    },
    /// Predict from a 19-field JSON payload (file or stdin), or from raw
    /// readings plus a date and time
    Predict {
        #[arg(long, default_value = "rf_model.bin")]
        artifact: PathBuf,
        #[arg(long)]
        payload: Option<PathBuf>,
        /// JSON object keyed by raw column name
        #[arg(long, conflicts_with = "payload", requires_all = ["date", "time"])]
        readings: Option<PathBuf>,
        /// DD/MM/YYYY
        #[arg(long, requires = "readings")]
        date: Option<String>,
        /// HH.MM.SS or a bare hour
        #[arg(long, requires = "readings")]
        time: Option<String>,
    },
    /// Build the 19-field payload from sensor readings and a date/time
    Encode {
        /// DD/MM/YYYY
        #[arg(long)]
        date: String,
        /// HH.MM.SS as in the export, or a bare hour
        #[arg(long)]
        time: String,
        /// JSON object keyed by raw column name, e.g. {"CO(GT)": 2.6}
        #[arg(long)]
        readings: PathBuf,
    },
}

/// Raw rows in, fitted artifact out. Any error aborts the run.
fn fit_pipeline(
    raw: &[RawRecord],
    cfg: &PipelineConfig,
) -> error::Result<(ModelArtifact, Option<Evaluation>)> {
    cfg.validate()?;

    info!("Preprocessing...");
    let (cleaned, report) = preprocess::clean(raw);
    for (channel, (mean, filled)) in &report.imputed {
        info!(%channel, mean, filled, "mean-imputed");
    }
    if report.rows_dropped > 0 {
        warn!(
            dropped = report.rows_dropped,
            of = report.input_rows - report.duplicates_removed,
            "rows still incomplete after imputation"
        );
    }
    let table = features::build_table(&cleaned)?;

    info!("Splitting...");
    let split = split::plan(&table, &cfg.split)?;
    let (capper, capped) = OutlierCapper::fit_apply(&split)?;
    for (name, b) in features::Feature::column_names().iter().zip(capper.bounds()) {
        debug!(feature = %name, lower = b.lower, upper = b.upper, median = b.median, "capping bounds");
    }

    info!("Training the final model...");
    let artifact = model::train(&capped, cfg)?;

    let evaluation = match model::evaluate(&artifact, &capped.test.table) {
        Ok(e) => {
            info!(rows = e.rows, r2 = e.r2, mae = e.mae, mse = e.mse, "held-out test");
            Some(e)
        }
        Err(e) => {
            warn!(error = %e, "held-out evaluation skipped");
            None
        }
    };
    Ok((artifact, evaluation))
}

fn run_training(cfg: &PipelineConfig) -> error::Result<ModelArtifact> {
    info!("Loading data...");
    let raw = io::load_csv(&cfg.data_path)?;
    let (artifact, _) = fit_pipeline(&raw, cfg)?;

    info!("Saving the model...");
    io::save_artifact(&artifact, &cfg.artifact_path)?;
    info!("Training complete.");
    Ok(artifact)
}

/// Raw snapshot path: the service does the calendar encoding itself.
fn predict_from_readings(
    service: &PredictionService,
    readings: &Path,
    date: &str,
    time: &str,
) -> error::Result<Prediction> {
    let readings = io::load_readings(readings)?;
    service.predict_snapshot(
        &readings,
        temporal::parse_date(date)?,
        temporal::parse_hour(time)?,
    )
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("benzene_predictor=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Train {
            data,
            artifact,
            config,
            seed,
            trees,
            model,
        } => {
            let mut cfg = match config {
                Some(path) => PipelineConfig::from_json_file(path)?,
                None => PipelineConfig::default(),
            };
            if let Some(d) = data {
                cfg.data_path = d;
            }
            if let Some(a) = artifact {
                cfg.artifact_path = a;
            }
            if let Some(s) = seed {
                cfg.split.seed = s;
                cfg.forest.seed = s;
            }
            if let Some(t) = trees {
                cfg.forest.n_trees = t;
            }
            if let Some(m) = model {
                cfg.model = m;
            }
            run_training(&cfg)?;
        }
        Command::Predict {
            artifact,
            payload,
            readings,
            date,
            time,
        } => {
            let service = PredictionService::new(Arc::new(io::load_artifact(&artifact)?));
            let prediction = match (readings, date, time) {
                (Some(r), Some(d), Some(t)) => predict_from_readings(&service, &r, &d, &t)?,
                _ => {
                    let payload = match payload {
                        Some(path) => ServingPayload::from_json(File::open(path)?)?,
                        None => ServingPayload::from_json(std::io::stdin().lock())?,
                    };
                    service.predict_payload(&payload)?
                }
            };
            println!("{}", serde_json::to_string(&prediction)?);
        }
        Command::Encode {
            date,
            time,
            readings,
        } => {
            let readings = io::load_readings(readings)?;
            let date = temporal::parse_date(&date)?;
            let v = serving::encode_snapshot(&readings, date, temporal::parse_hour(&time)?)?;
            println!("{}", serde_json::to_string_pretty(&ServingPayload::from_vector(&v))?);
        }
    }
    Ok(())
}

/// the test functions
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForestConfig;
    use crate::error::PipelineError;
    use crate::preprocess::Channel;
    use approx::assert_abs_diff_eq;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use std::io::Write;

    const HEADER: &str = "Date;Time;CO(GT);PT08.S1(CO);NMHC(GT);C6H6(GT);PT08.S2(NMHC);NOx(GT);PT08.S3(NOx);NO2(GT);PT08.S4(NO2);PT08.S5(O3);T;RH;AH;;";

    fn comma(v: f64) -> String {
        format!("{v:.3}").replace('.', ",")
    }

    /// Hourly rows starting 10/03/2004 18:00; benzene tracks CO.
    fn write_fixture(path: &Path, rows: usize) -> std::io::Result<()> {
        let mut f = File::create(path)?;
        writeln!(f, "{HEADER}")?;
        let start = NaiveDate::from_ymd_opt(2004, 3, 10)
            .unwrap()
            .and_hms_opt(18, 0, 0)
            .unwrap();
        for i in 0..rows {
            let ts: NaiveDateTime = start + Duration::hours(i as i64);
            let co = 0.5 + (i % 13) as f64 * 0.4;
            // every 10th CO reading is unmeasured
            let co_field = if i % 10 == 7 { "-200".to_string() } else { comma(co) };
            let values = [
                co_field,
                comma(900.0 + co * 150.0),
                "-200".to_string(),
                comma(co * 4.0 + 0.3),
                comma(800.0 + co * 120.0),
                comma(100.0 + (i % 7) as f64 * 10.0),
                comma(1100.0 - co * 50.0),
                comma(80.0 + (i % 5) as f64 * 6.0),
                comma(1500.0 + (i % 11) as f64 * 9.0),
                comma(1000.0 + co * 80.0),
                comma(10.0 + (i % 24) as f64 * 0.5),
                comma(40.0 + (i % 17) as f64),
                comma(0.6 + (i % 9) as f64 * 0.02),
            ];
            writeln!(
                f,
                "{};{};{};;",
                ts.format("%d/%m/%Y"),
                ts.format("%H.%M.%S"),
                values.join(";")
            )?;
        }
        Ok(())
    }

    fn quick_config(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            data_path: dir.join("air.csv").to_string_lossy().into_owned(),
            artifact_path: dir.join("model.bin").to_string_lossy().into_owned(),
            forest: ForestConfig {
                n_trees: 12,
                max_depth: 10,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_training_run_writes_loadable_artifact() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let cfg = quick_config(dir.path());
        write_fixture(Path::new(&cfg.data_path), 150)?;

        let trained = run_training(&cfg)?;
        let loaded = io::load_artifact(&cfg.artifact_path)?;
        assert_eq!(trained, loaded);
        assert_eq!(loaded.feature_names, features::Feature::column_names());
        Ok(())
    }

    #[test]
    fn test_training_is_reproducible() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let cfg = quick_config(dir.path());
        write_fixture(Path::new(&cfg.data_path), 120)?;
        let raw = io::load_csv(&cfg.data_path)?;

        let (a, _) = fit_pipeline(&raw, &cfg)?;
        let (b, _) = fit_pipeline(&raw, &cfg)?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_forest_tracks_benzene() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let cfg = quick_config(dir.path());
        write_fixture(Path::new(&cfg.data_path), 300)?;
        let raw = io::load_csv(&cfg.data_path)?;

        let (_, eval) = fit_pipeline(&raw, &cfg)?;
        let eval = eval.ok_or("no evaluation")?;
        assert_eq!(eval.rows, 60);
        assert!(eval.r2 > 0.7, "r2 was {}", eval.r2);
        Ok(())
    }

    #[test]
    fn test_sentinel_imputed_before_split() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("air.csv");
        write_fixture(&path, 40)?;
        let raw = io::load_csv(&path)?;

        let measured: Vec<f64> = raw
            .iter()
            .map(|r| r.reading(Channel::CoGt))
            .filter(|&v| v != preprocess::SENTINEL_MISSING)
            .collect();
        let mean = measured.iter().sum::<f64>() / measured.len() as f64;

        let (cleaned, _) = preprocess::clean(&raw);
        assert_eq!(cleaned.len(), 40);
        assert_abs_diff_eq!(cleaned[7].readings[&Channel::CoGt], mean, epsilon = 1e-9);
        assert_abs_diff_eq!(cleaned[17].readings[&Channel::CoGt], mean, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn test_training_and_serving_rows_identical() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("air.csv");
        write_fixture(&path, 30)?;
        let (cleaned, _) = preprocess::clean(&io::load_csv(&path)?);
        let table = features::build_table(&cleaned)?;

        for (i, rec) in cleaned.iter().enumerate() {
            let mut live = rec.readings.clone();
            live.remove(&Channel::TARGET);
            let served = serving::encode_snapshot(&live, rec.date, rec.hour)?;
            let payload = ServingPayload::from_vector(&served);
            let wire = features::assemble(&payload)?;
            for (j, (a, b)) in table.features.row(i).iter().zip(wire.as_slice()).enumerate() {
                assert_eq!(a.to_bits(), b.to_bits(), "row {i} column {j}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_service_predicts_from_trained_artifact() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let cfg = quick_config(dir.path());
        write_fixture(Path::new(&cfg.data_path), 120)?;
        run_training(&cfg)?;

        let service = PredictionService::new(Arc::new(io::load_artifact(&cfg.artifact_path)?));
        let readings: std::collections::BTreeMap<Channel, f64> = [
            (Channel::CoGt, 2.1),
            (Channel::Pt08S1Co, 1215.0),
            (Channel::Pt08S2Nmhc, 1052.0),
            (Channel::NoxGt, 130.0),
            (Channel::Pt08S3Nox, 995.0),
            (Channel::No2Gt, 92.0),
            (Channel::Pt08S4No2, 1545.0),
            (Channel::Pt08S5O3, 1168.0),
            (Channel::Temperature, 15.0),
            (Channel::RelativeHumidity, 48.0),
            (Channel::AbsoluteHumidity, 0.7),
        ]
        .into_iter()
        .collect();
        let date = NaiveDate::from_ymd_opt(2004, 3, 12).ok_or("date")?;
        let p = service.predict_snapshot(&readings, date, 9)?;
        assert!(p.value.is_finite());
        assert!(p.value > 0.0 && p.value < 20.0, "predicted {}", p.value);

        // same snapshot given as a readings file, the way `predict --readings` takes it
        let json: std::collections::BTreeMap<&str, f64> =
            readings.iter().map(|(c, v)| (c.column(), *v)).collect();
        let readings_path = dir.path().join("readings.json");
        serde_json::to_writer(File::create(&readings_path)?, &json)?;
        let from_file = predict_from_readings(&service, &readings_path, "12/03/2004", "09.00.00")?;
        assert_eq!(from_file.value.to_bits(), p.value.to_bits());
        assert_eq!(from_file.hazard, p.hazard);
        Ok(())
    }

    #[test]
    fn test_predict_accepts_payload_or_snapshot() {
        let snapshot = Cli::try_parse_from([
            "benzene_predictor", "predict", "--readings", "r.json", "--date", "12/03/2004",
            "--time", "09.00.00",
        ]);
        assert!(matches!(
            snapshot.map(|c| c.command),
            Ok(Command::Predict { readings: Some(_), date: Some(_), time: Some(_), .. })
        ));
        assert!(Cli::try_parse_from(["benzene_predictor", "predict", "--readings", "r.json"]).is_err());
        assert!(Cli::try_parse_from([
            "benzene_predictor", "predict", "--payload", "p.json", "--readings", "r.json",
            "--date", "12/03/2004", "--time", "9",
        ])
        .is_err());
        assert!(Cli::try_parse_from(["benzene_predictor", "predict", "--payload", "p.json"]).is_ok());
    }

    #[test]
    fn test_malformed_row_fails_run_without_artifact() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let cfg = quick_config(dir.path());
        write_fixture(Path::new(&cfg.data_path), 50)?;
        let mut f = std::fs::OpenOptions::new().append(true).open(&cfg.data_path)?;
        writeln!(f, "12/03/2004;20.00.00;oops;1;1;1;1;1;1;1;1;1;1;1;1;;")?;

        match run_training(&cfg) {
            Err(PipelineError::DataFormat { line, .. }) => assert_eq!(line, 52),
            other => panic!("expected a data format error, got {other:?}"),
        }
        assert!(!Path::new(&cfg.artifact_path).exists());
        Ok(())
    }
}
