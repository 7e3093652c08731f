// src/notify/email.rs
//! `mailto:` recipients delivered over SMTP.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};

use super::template::BodyFormat;
use super::{NotificationChannel, NotificationMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub from: String,
}

pub struct EmailChannel {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailChannel {
    pub fn new(cfg: &SmtpSettings) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
            .with_context(|| format!("invalid SMTP host '{}'", cfg.host))?;
        if let Some(port) = cfg.port {
            builder = builder.port(port);
        }
        if let (Some(user), Some(pass)) = (&cfg.user, &cfg.pass) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        let from = cfg
            .from
            .parse()
            .with_context(|| format!("invalid sender '{}'", cfg.from))?;
        Ok(Self {
            mailer: builder.build(),
            from,
        })
    }
}

/// `mailto:a@x.org,b@y.org?format=html` → recipients + format.
pub fn parse_mailto(url: &str) -> Result<(Vec<Mailbox>, BodyFormat)> {
    let rest = url
        .strip_prefix("mailto:")
        .ok_or_else(|| anyhow!("not a mailto url"))?;
    let (addrs, query) = rest.split_once('?').unwrap_or((rest, ""));
    let format = if query
        .split('&')
        .any(|kv| kv.eq_ignore_ascii_case("format=html"))
    {
        BodyFormat::Html
    } else {
        BodyFormat::Text
    };
    let to = addrs
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|a| a.parse::<Mailbox>().with_context(|| format!("invalid recipient '{a}'")))
        .collect::<Result<Vec<_>>>()?;
    if to.is_empty() {
        return Err(anyhow!("mailto url has no recipients"));
    }
    Ok((to, format))
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn accepts(&self, url: &str) -> bool {
        url.starts_with("mailto:")
    }

    fn format_for(&self, url: &str) -> BodyFormat {
        parse_mailto(url).map(|(_, f)| f).unwrap_or_default()
    }

    async fn send(&self, url: &str, msg: &NotificationMessage) -> Result<String> {
        let (to, _) = parse_mailto(url)?;
        let mut builder = Message::builder().from(self.from.clone()).subject(msg.title.clone());
        for mb in to {
            builder = builder.to(mb);
        }
        let content_type = match msg.format {
            BodyFormat::Html => header::ContentType::TEXT_HTML,
            BodyFormat::Text => header::ContentType::TEXT_PLAIN,
        };
        let email = builder
            .header(content_type)
            .body(msg.body.clone())
            .context("build email")?;

        let rsp = self.mailer.send(email).await.context("send email")?;
        Ok(rsp.code().to_string())
    }
}
