//! auth-service CLI 分发：`run`、`doctor`、`gen-key`、`hash-password`、`version`。

use std::io::{BufRead, IsTerminal};

use anyhow::{Context, anyhow, bail};
use serde_json::json;

use crate::{
    auth::{
        keys::{Algorithm, KeyEntry, generate_key_material},
        password::hash_password_blocking,
    },
    config::Config,
};

/// CLI 分发结果。
pub(crate) enum CliDispatch {
    /// 继续进入服务主循环。
    Run,
    /// 命令已处理完成，主程序应退出。
    Exit,
}

/// 解析并执行 CLI。
pub(crate) fn dispatch(args: &[String]) -> anyhow::Result<CliDispatch> {
    if args.is_empty() {
        return Ok(CliDispatch::Run);
    }

    let cmd = args[0].trim();
    if cmd.is_empty() || cmd == "run" {
        return Ok(CliDispatch::Run);
    }

    if matches!(cmd, "-h" | "--help" | "help") {
        print_root_help();
        return Ok(CliDispatch::Exit);
    }

    match cmd {
        "doctor" => {
            let format = parse_doctor_format(&args[1..])?;
            run_doctor(format);
            Ok(CliDispatch::Exit)
        }
        "gen-key" => {
            let alg = parse_gen_key_alg(&args[1..])?;
            run_gen_key(alg)?;
            Ok(CliDispatch::Exit)
        }
        "hash-password" => {
            run_hash_password()?;
            Ok(CliDispatch::Exit)
        }
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(CliDispatch::Exit)
        }
        other => Err(anyhow!(
            "unknown command: {other}; run `auth-service --help` for usage"
        )),
    }
}

/// `doctor` 输出格式。
#[derive(Debug, PartialEq, Eq)]
enum DoctorFormat {
    Text,
    Json,
}

/// 解析 doctor 的 `--format` 参数。
fn parse_doctor_format(args: &[String]) -> anyhow::Result<DoctorFormat> {
    if args.is_empty() {
        return Ok(DoctorFormat::Text);
    }
    if args.len() == 2 && args[0] == "--format" {
        return match args[1].as_str() {
            "text" => Ok(DoctorFormat::Text),
            "json" => Ok(DoctorFormat::Json),
            other => Err(anyhow!("unsupported doctor format: {other}")),
        };
    }
    Err(anyhow!("usage: auth-service doctor [--format text|json]"))
}

fn parse_gen_key_alg(args: &[String]) -> anyhow::Result<Algorithm> {
    let [raw] = args else {
        bail!("usage: auth-service gen-key <hs256|hs512|eddsa>");
    };
    Algorithm::from_config(raw).ok_or_else(|| anyhow!("unsupported algorithm: {raw}"))
}

/// 打印配置与密钥环检查结果；配置不可用时以非零码退出。
fn run_doctor(format: DoctorFormat) {
    let checked = Config::from_env().and_then(|config| {
        let ring = config.key_ring()?;
        let keys = ring
            .entries()
            .into_iter()
            .map(|entry| {
                json!({
                    "kid": entry.kid(),
                    "alg": entry.alg().as_str(),
                    "canSign": entry.can_sign(),
                    "active": entry.kid() == ring.active().kid(),
                })
            })
            .collect::<Vec<_>>();
        Ok((config, keys))
    });

    let healthy = checked.is_ok();
    match (format, checked) {
        (DoctorFormat::Text, Ok((config, keys))) => {
            println!("config: ok");
            println!("addr: {}", config.addr);
            println!("issuer: {}", config.issuer);
            println!(
                "credential-store: {}",
                if config.database_url.is_some() { "postgres" } else { "memory" }
            );
            println!(
                "session-cache: {}",
                if config.redis_url.is_some() { "redis" } else { "memory" }
            );
            for key in keys {
                println!(
                    "key: {} {} sign={} active={}",
                    key["kid"].as_str().unwrap_or_default(),
                    key["alg"].as_str().unwrap_or_default(),
                    key["canSign"],
                    key["active"],
                );
            }
        }
        (DoctorFormat::Text, Err(err)) => {
            println!("config: error");
            println!("reason: {err:#}");
        }
        (DoctorFormat::Json, result) => {
            let payload = match result {
                Ok((config, keys)) => json!({
                    "ok": true,
                    "config": config.summary(),
                    "keys": keys,
                }),
                Err(err) => json!({
                    "ok": false,
                    "error": format!("{err:#}"),
                }),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "{}".to_string())
            );
        }
    }

    if !healthy {
        std::process::exit(1);
    }
}

/// 生成签名密钥，输出可直接写入环境变量的形式。
fn run_gen_key(alg: Algorithm) -> anyhow::Result<()> {
    let material = generate_key_material(alg);
    match alg {
        Algorithm::EdDsa => {
            let entry = KeyEntry::ed25519_signing(None, &material)?;
            println!("AUTH_JWT_ALG=EdDSA");
            println!("AUTH_JWT_ED25519_SEED={material}");
            if let Some(public) = entry.public_key_b64() {
                println!("# verify-only entry: {}:EdDSA:{public}", entry.kid());
            }
        }
        _ => {
            println!("AUTH_JWT_ALG={alg}");
            println!("AUTH_JWT_SECRET={material}");
        }
    }
    Ok(())
}

/// 从 stdin 读取一行口令，输出 Argon2id PHC 字符串。
fn run_hash_password() -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        eprintln!("password:");
    }
    let mut line = String::new();
    stdin
        .lock()
        .read_line(&mut line)
        .context("read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("empty password");
    }
    let params = Config::from_env()?.hash_params;
    let hash = hash_password_blocking(params, password).map_err(|err| anyhow!("{err}"))?;
    println!("{hash}");
    Ok(())
}

/// 打印 root help。
fn print_root_help() {
    println!("auth-service usage:");
    println!("  auth-service run");
    println!("  auth-service doctor [--format text|json]");
    println!("  auth-service gen-key <hs256|hs512|eddsa>");
    println!("  auth-service hash-password < password.txt");
    println!("  auth-service version");
}

#[cfg(test)]
mod tests {
    use super::{CliDispatch, DoctorFormat, dispatch, parse_doctor_format, parse_gen_key_alg};
    use crate::auth::keys::Algorithm;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn empty_or_run_starts_service() {
        assert!(matches!(dispatch(&[]).unwrap(), CliDispatch::Run));
        assert!(matches!(dispatch(&args(&["run"])).unwrap(), CliDispatch::Run));
        assert!(matches!(
            dispatch(&args(&["version"])).unwrap(),
            CliDispatch::Exit
        ));
        assert!(dispatch(&args(&["serve-forever"])).is_err());
    }

    #[test]
    fn doctor_format_parsing() {
        assert_eq!(parse_doctor_format(&[]).unwrap(), DoctorFormat::Text);
        assert_eq!(
            parse_doctor_format(&args(&["--format", "json"])).unwrap(),
            DoctorFormat::Json
        );
        assert!(parse_doctor_format(&args(&["--format", "yaml"])).is_err());
        assert!(parse_doctor_format(&args(&["json"])).is_err());
    }

    #[test]
    fn gen_key_requires_one_known_algorithm() {
        assert_eq!(
            parse_gen_key_alg(&args(&["hs512"])).unwrap(),
            Algorithm::Hs512
        );
        assert_eq!(
            parse_gen_key_alg(&args(&["EdDSA"])).unwrap(),
            Algorithm::EdDsa
        );
        assert!(parse_gen_key_alg(&args(&["none"])).is_err());
        assert!(parse_gen_key_alg(&[]).is_err());
    }
}
