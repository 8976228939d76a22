use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

#[async_trait]
pub trait Task: Send + Sync {
	async fn run(&self, input: &Value) -> Result<Value>;
}

/// Wrap an async closure as a `Task`.
pub fn from_async_fn<F, Fut>(f: F) -> Arc<dyn Task>
where
	F: Send + Sync + 'static + Fn(&Value) -> Fut,
	Fut: Future<Output = Result<Value>> + Send + 'static,
{
	struct ClosureTask<F, Fut> {
		f: F,
		_fut: PhantomData<fn() -> Fut>,
	}

	#[async_trait]
	impl<F, Fut> Task for ClosureTask<F, Fut>
	where
		F: Send + Sync + 'static + Fn(&Value) -> Fut,
		Fut: Future<Output = Result<Value>> + Send + 'static,
	{
		async fn run(&self, input: &Value) -> Result<Value> {
			(self.f)(input).await
		}
	}

	Arc::new(ClosureTask { f, _fut: PhantomData })
}

/// Returns the input unchanged.
pub struct IdentityTask;

#[async_trait]
impl Task for IdentityTask {
	async fn run(&self, input: &Value) -> Result<Value> {
		Ok(input.clone())
	}
}

/// Calls an HTTP endpoint with the case input.
///
/// POST sends `{ "input": <value> }` as the JSON body; GET sends `?input=<json>`.
/// The JSON response body is the task output.
pub struct HttpTask {
	client: reqwest::Client,
	url: String,
	method: HttpMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
	Get,
	Post,
}

impl HttpMethod {
	pub fn parse(s: &str) -> Self {
		if s.eq_ignore_ascii_case("GET") {
			HttpMethod::Get
		} else {
			HttpMethod::Post
		}
	}
}

impl HttpTask {
	pub fn new(url: impl Into<String>, method: HttpMethod) -> Self {
		Self {
			client: reqwest::Client::new(),
			url: url.into(),
			method,
		}
	}
}

#[async_trait]
impl Task for HttpTask {
	async fn run(&self, input: &Value) -> Result<Value> {
		let resp = match self.method {
			HttpMethod::Get => {
				let q = [("input", input.to_string())];
				self.client.get(&self.url).query(&q).send().await?
			}
			HttpMethod::Post => {
				self.client
					.post(&self.url)
					.json(&json!({ "input": input }))
					.send()
					.await?
			}
		};
		let status = resp.status();
		let v = resp.json::<Value>().await?;
		if !status.is_success() {
			anyhow::bail!("HTTP {}: {}", status.as_u16(), v);
		}
		Ok(v)
	}
}
