use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use futures_util::StreamExt;

use openwork_core_sdk::prelude::*;

/**
 * \brief CLI 程序入口：配置自定义 OpenAI 兼容 Provider 并与之对话。
 */
#[derive(Parser, Debug)]
#[command(
    name = "openwork",
    version,
    about = "Connect Openwork to a self-hosted OpenAI-compatible server"
)]
struct Cli {
    /// Override the generated opencode.json path
    #[arg(long, global = true, env = "OPENWORK_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Also write logs to the Openwork log directory
    #[arg(long, global = true)]
    telemetry: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 提交设置表单并连接；缺失的字段会交互式询问。
     */
    Connect {
        /// Provider name shown in Openwork
        #[arg(long)]
        name: Option<String>,
        /// Server URL including scheme and path, e.g. http://localhost:8000/v1
        #[arg(long)]
        url: Option<String>,
        /// API key, stored in the OS keychain only
        #[arg(long, env = "OPENWORK_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
        /// Connect without an API key
        #[arg(long, conflicts_with = "api_key")]
        no_api_key: bool,
        /// Model ID served by the endpoint
        #[arg(long)]
        model: Option<String>,
        /// Test the connection before saving
        #[arg(long)]
        test: bool,
    },

    /** \brief 断开并删除密钥与配置。 */
    Disconnect,

    /** \brief 显示当前配置。 */
    Status,

    /** \brief 列出服务端模型。 */
    Models,

    /** \brief 连接测试。 */
    Health,

    /**
     * \brief 发送一条用户消息并显示模型回复。
     */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long, default_value_t = false)]
        no_stream: bool,
    },

    /**
     * \brief 启动本地 HTTP 服务并提供设置 API 与前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            if let Some(hint) = err
                .chain()
                .find_map(|e| e.downcast_ref::<ProviderError>())
                .and_then(ProviderError::hint)
            {
                eprintln!("hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut settings = AppSettings::from_env().context("load settings failed")?;
    if let Some(path) = cli.config {
        settings.config_path = path;
    }
    settings.telemetry_enabled |= cli.telemetry;

    let default_level = if matches!(cli.command, Commands::Serve { .. }) {
        "info"
    } else {
        "warn"
    };
    telemetry::init(&settings.log_dir, settings.telemetry_enabled, default_level)
        .context("init logging failed")?;
    tracing::debug!(
        config = %settings.config_path.display(),
        keychain_service = %settings.keychain_service,
        "settings loaded"
    );

    let generator = ConfigGenerator::new(&settings.config_path);
    let store: Arc<dyn CredentialStore> =
        Arc::new(KeyringStore::new(settings.keychain_service.clone()));
    let router = RequestRouter::new(generator.clone(), store.clone(), settings.request_timeout)
        .context("create request router failed")?;

    match cli.command {
        Commands::Connect {
            name,
            url,
            api_key,
            no_api_key,
            model,
            test,
        } => {
            let submitted = fill_form(name, url, api_key, no_api_key, model)?;
            if test {
                let report = llm::health_preview(router.client(), &submitted).await?;
                print_health(&report);
                if !report.ok {
                    anyhow::bail!("connection test failed, settings not saved");
                }
            }
            let outcome =
                form::connect(&submitted, store.as_ref(), &generator).context("connect failed")?;
            if let Some(old) = outcome.replaced.as_deref() {
                println!("Replaced provider {}", old);
            }
            println!(
                "Connected {} ({} | {}) -> {}",
                outcome.profile.name,
                outcome.profile.base_url,
                outcome.profile.model_id,
                outcome.config_path.display()
            );
            if let Some(key_ref) = outcome.profile.api_key_ref.as_ref() {
                println!("API key stored in keychain as {}", key_ref);
            }
        }
        Commands::Disconnect => {
            match form::disconnect(store.as_ref(), &generator).context("disconnect failed")? {
                Some(profile) => println!("Disconnected {}", profile.name),
                None => println!("No custom provider configured"),
            }
        }
        Commands::Status => match generator.load().context("load configuration failed")? {
            Some(profile) => {
                println!("provider : {}", profile.name);
                println!("server   : {}", profile.base_url);
                println!("model    : {}", profile.model_id);
                match profile.api_key_ref {
                    Some(key_ref) => println!("api key  : {}", key_ref),
                    None => println!("api key  : (none)"),
                }
                println!("config   : {}", generator.path().display());
            }
            None => println!("No custom provider configured ({})", generator.path().display()),
        },
        Commands::Models => {
            for model in router.list_models().await? {
                println!("{}", model);
            }
        }
        Commands::Health => {
            let report = router.health().await?;
            print_health(&report);
            if !report.ok {
                anyhow::bail!("health check failed");
            }
        }
        Commands::Chat {
            prompt,
            system,
            no_stream,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message::system(system));
            }
            messages.push(Message::user(prompt));
            telemetry::log_event(
                "cli.chat",
                &format!("messages={} stream={}", messages.len(), !no_stream),
            );

            if no_stream {
                let reply = router.chat_once(&messages).await?;
                println!("{}", reply.content);
            } else {
                let mut stream = router
                    .stream_chat(&messages)
                    .await
                    .context("create stream failed")?;
                let mut stdout = std::io::stdout();
                while let Some(delta) = stream
                    .as_mut()
                    .next()
                    .await
                    .transpose()
                    .context("stream error")?
                {
                    print!("{}", delta);
                    stdout.flush().ok();
                }
                println!();
            }
        }
        Commands::Serve { addr } => {
            let state = server::AppState::new(router);
            server::run(&addr, state, settings.ui_dir).await?;
        }
    }

    Ok(())
}

/**
 * \brief 合并命令行参数与交互输入，得到完整表单。
 */
fn fill_form(
    name: Option<String>,
    url: Option<String>,
    api_key: Option<String>,
    no_api_key: bool,
    model: Option<String>,
) -> Result<SettingsForm> {
    let interactive = std::io::stdin().is_terminal();
    let ask = |value: Option<String>, prompt: &str, flag: &str| -> Result<String> {
        match value {
            Some(v) => Ok(v),
            None if interactive => Ok(Input::<String>::new()
                .with_prompt(prompt)
                .interact_text()?),
            None => anyhow::bail!("missing --{} (stdin is not a terminal)", flag),
        }
    };

    let provider_name = ask(name, "Provider Name", "name")?;
    let server_url = ask(url, "Server URL", "url")?;
    // URL 不合法时不再询问后续字段
    form::validate_base_url(&server_url)?;
    let api_key = match api_key {
        Some(key) => Some(key),
        None if no_api_key || !interactive => None,
        None => Some(
            Password::new()
                .with_prompt("API Key (optional)")
                .allow_empty_password(true)
                .interact()?,
        ),
    };
    let model_id = ask(model, "Model ID", "model")?;

    Ok(SettingsForm::new(provider_name, server_url, api_key, model_id))
}

fn print_health(report: &llm::HealthReport) {
    if report.ok {
        println!(
            "OK {} ({}) - {} models available{}",
            report.provider,
            report.base,
            report.models,
            if report.model_listed {
                String::new()
            } else {
                format!(", `{}` not listed by the server", report.model)
            }
        );
    } else {
        println!(
            "FAILED {} ({}): {}",
            report.provider,
            report.base,
            report.error.as_deref().unwrap_or("unknown error")
        );
        if let Some(hint) = report.hint.as_deref() {
            println!("hint: {}", hint);
        }
    }
}
