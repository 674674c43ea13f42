use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::REFERER;
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use crate::error::CrawlError;

pub const DEFAULT_BASE_URL: &str = "https://bannerweb.wpi.edu";

const LOGIN_PATH: &str = "/pls/prod/twbkwbis.P_WWWLogin";
const VALIDATE_PATH: &str = "/pls/prod/twbkwbis.P_ValLogin";
const SELECT_YEAR_PATH: &str = "/pls/prod/hwwkscevrp.P_Select_Year";
const SELECT_SECTION_PATH: &str = "/pls/prod/hwwkscevrp.P_Select_CrseSect";

const SESSION_COOKIE: &str = "SESSID";
const PAGE_TIMEOUT: Duration = Duration::from_secs(60);
const LISTING_TIMEOUT: Duration = Duration::from_secs(600);

static CRN_PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"IN_CRN=(\d+)").expect("valid regex"));
static YEAR_PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"IN_ACYR=(\d+)").expect("valid regex"));
static ADLN_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"IN_ADLN_OIX=([^&;]*)").expect("valid regex"));

static CLASS_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::parse("table.datadisplaytable a[href]").expect("valid selector"));
static LISTING_TABLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse("table.datadisplaytable").expect("valid selector"));
static YEAR_OPTION: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"select[name="IN_ACYR"] option"#).expect("valid selector"));

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub base_url: Url,
    pub credentials: Credentials,
}

/// Where evaluation pages come from.
#[allow(async_fn_in_trait)]
pub trait PageSource {
    async fn discover_years(&mut self) -> Result<Vec<i32>, CrawlError>;

    async fn discover_urls(
        &mut self,
        year: i32,
        adln: bool,
        crns: &[i32],
    ) -> Result<Vec<String>, CrawlError>;

    async fn fetch_page(&mut self, reference: &str) -> Result<String, CrawlError>;
}

struct Session {
    client: Client,
    jar: Arc<Jar>,
}

/// Authenticated crawler over the evaluation site. Owns exactly one session;
/// logging in again throws the old cookie jar away.
pub struct SessionCrawler {
    config: CrawlerConfig,
    session: Option<Session>,
}

impl SessionCrawler {
    pub fn new(config: CrawlerConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    pub async fn login(&mut self) -> Result<(), CrawlError> {
        info!(user = %self.config.credentials.username, "logging in");
        self.session = None;

        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .build()?;

        let home = self.config.base_url.clone();
        client
            .get(home.clone())
            .timeout(PAGE_TIMEOUT)
            .send()
            .await
            .map_err(|err| CrawlError::from_request(home.as_str(), err))?;

        let validate = self.endpoint(VALIDATE_PATH)?;
        let referer = self.endpoint(LOGIN_PATH)?;
        client
            .post(validate.clone())
            .header(REFERER, referer.as_str())
            .form(&[
                ("sid", self.config.credentials.username.as_str()),
                ("PIN", self.config.credentials.password.as_str()),
            ])
            .timeout(PAGE_TIMEOUT)
            .send()
            .await
            .map_err(|err| CrawlError::from_request(validate.as_str(), err))?;

        let session_url = self.endpoint(SELECT_SECTION_PATH)?;
        if !has_session_cookie(&jar, &session_url) {
            return Err(CrawlError::Auth(format!(
                "no {SESSION_COOKIE} cookie after validating credentials"
            )));
        }

        self.session = Some(Session { client, jar });
        info!("login succeeded");
        Ok(())
    }

    fn has_session(&self) -> bool {
        let Ok(url) = self.endpoint(SELECT_SECTION_PATH) else {
            return false;
        };
        self.session
            .as_ref()
            .is_some_and(|session| has_session_cookie(&session.jar, &url))
    }

    async fn client(&mut self) -> Result<Client, CrawlError> {
        if !self.has_session() {
            self.login().await?;
        }
        self.session
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or_else(|| CrawlError::Auth("session not established".to_string()))
    }

    fn endpoint(&self, path: &str) -> Result<Url, CrawlError> {
        self.config
            .base_url
            .join(path)
            .map_err(|err| CrawlError::Protocol(format!("invalid reference {path}: {err}")))
    }
}

impl PageSource for SessionCrawler {
    async fn discover_years(&mut self) -> Result<Vec<i32>, CrawlError> {
        let url = self.endpoint(SELECT_YEAR_PATH)?;
        let client = self.client().await?;
        let html = client
            .get(url.clone())
            .timeout(PAGE_TIMEOUT)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| CrawlError::from_request(url.as_str(), err))?
            .text()
            .await
            .map_err(|err| CrawlError::from_request(url.as_str(), err))?;

        let years = extract_years(&html);
        info!(count = years.len(), "discovered academic years");
        Ok(years)
    }

    async fn discover_urls(
        &mut self,
        year: i32,
        adln: bool,
        crns: &[i32],
    ) -> Result<Vec<String>, CrawlError> {
        let url = self.endpoint(SELECT_SECTION_PATH)?;
        let client = self.client().await?;
        info!(year, adln, "downloading class listing");

        let year_param = year.to_string();
        let html = client
            .post(url.clone())
            .form(&[
                ("IN_SUBCRSE", ""),
                ("IN_PIDM", ""),
                ("IN_ACYR", year_param.as_str()),
                ("IN_ADLN_OIX", adln_flag(adln)),
            ])
            .timeout(LISTING_TIMEOUT)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| CrawlError::from_request(url.as_str(), err))?
            .text()
            .await
            .map_err(|err| CrawlError::from_request(url.as_str(), err))?;

        let links = extract_class_links(&html, crns)?;
        info!(year, adln, count = links.len(), "class listing parsed");
        Ok(links)
    }

    async fn fetch_page(&mut self, reference: &str) -> Result<String, CrawlError> {
        let url = self.endpoint(reference)?;

        for attempt in 0..2 {
            let client = self.client().await?;
            let text = client
                .get(url.clone())
                .timeout(PAGE_TIMEOUT)
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .map_err(|err| CrawlError::from_request(reference, err))?
                .text()
                .await
                .map_err(|err| CrawlError::from_request(reference, err))?;

            if self.has_session() {
                debug!(reference, bytes = text.len(), "fetched page");
                return Ok(text);
            }
            if attempt == 0 {
                warn!(reference, "session expired during fetch, logging in again");
                self.login().await?;
            }
        }

        Err(CrawlError::Auth(format!(
            "session lost again while fetching {reference}"
        )))
    }
}

pub fn adln_flag(adln: bool) -> &'static str {
    if adln {
        "O"
    } else {
        "X"
    }
}

fn has_session_cookie(jar: &Jar, url: &Url) -> bool {
    jar.cookies(url)
        .and_then(|header| header.to_str().map(str::to_owned).ok())
        .is_some_and(|cookies| {
            cookies
                .split(';')
                .any(|cookie| cookie.trim_start().starts_with(&format!("{SESSION_COOKIE}=")))
        })
}

/// Class-detail links from a listing page, optionally narrowed to `crns`.
pub fn extract_class_links(html: &str, crns: &[i32]) -> Result<Vec<String>, CrawlError> {
    let document = Html::parse_document(html);
    if document.select(&LISTING_TABLE).next().is_none() {
        return Err(CrawlError::Protocol(
            "listing page has no datadisplaytable".to_string(),
        ));
    }

    let wanted: HashSet<i32> = crns.iter().copied().collect();
    let links = document
        .select(&CLASS_LINK)
        .filter_map(|link| link.value().attr("href"))
        .filter(|href| {
            if wanted.is_empty() {
                href.contains("IN_TYPE=C")
            } else {
                CRN_PARAM
                    .captures(href)
                    .and_then(|caps| caps[1].parse::<i32>().ok())
                    .is_some_and(|crn| wanted.contains(&crn))
            }
        })
        .map(str::to_string)
        .collect();
    Ok(links)
}

pub fn extract_years(html: &str) -> Vec<i32> {
    let document = Html::parse_document(html);
    let mut years: Vec<i32> = document
        .select(&YEAR_OPTION)
        .filter_map(|option| option.value().attr("value"))
        .filter(|value| value.len() == 4)
        .filter_map(|value| value.parse().ok())
        .collect();
    years.sort_unstable();
    years.dedup();
    years
}

/// Identity of one class as encoded in its detail reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRef {
    pub reference: String,
    pub crn: i32,
    pub academic_year: Option<i32>,
    pub adln: Option<bool>,
}

impl ClassRef {
    /// Decodes a detail reference. A reference without a CRN is not a class
    /// link and yields `None`; an ADLN flag other than O or X is an error.
    pub fn parse(reference: &str) -> Result<Option<Self>, CrawlError> {
        let adln = match ADLN_PARAM.captures(reference) {
            None => None,
            Some(caps) => match &caps[1] {
                "O" => Some(true),
                "X" => Some(false),
                other => {
                    return Err(CrawlError::Protocol(format!(
                        "ADLN flag must be O or X, got {other:?} in {reference}"
                    )))
                }
            },
        };
        let Some(crn) = CRN_PARAM
            .captures(reference)
            .and_then(|caps| caps[1].parse().ok())
        else {
            return Ok(None);
        };
        let academic_year = YEAR_PARAM
            .captures(reference)
            .and_then(|caps| caps[1].parse().ok());

        Ok(Some(Self {
            reference: reference.to_string(),
            crn,
            academic_year,
            adln,
        }))
    }
}
