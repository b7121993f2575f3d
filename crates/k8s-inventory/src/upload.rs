//! Bounded-concurrency delivery of chunked payload families.
//!
//! Each family is serialized item by item, split into pages with
//! [`crate::chunk::chunk`] and posted by a pool of at most `max_concurrency`
//! workers. [`Uploader::send_family`] only returns once every dispatched page
//! has finished, so families never interleave. The first failing page cancels
//! the pages that have not started yet.

use std::{fmt, sync::Arc};

use bon::Builder;
use serde::{ser::SerializeMap, Serialize, Serializer};
use serde_json::value::{to_raw_value, RawValue};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
	chunk::{chunk, ChunkLimits},
	client::{ClientError, IngestClient},
	session::Session,
};

/// The three kinds of data delivered during a run, in delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadFamily {
	Objects,
	Trees,
	Releases,
}

impl PayloadFamily {
	/// Path below `fetching/` the family is posted to.
	pub fn path(self) -> &'static str {
		match self {
			Self::Objects => "objects",
			Self::Trees => "tree",
			Self::Releases => "helm",
		}
	}

	/// Body key holding the page items.
	pub fn items_key(self) -> &'static str {
		match self {
			Self::Objects => "k8sObjects",
			Self::Trees => "k8sTrees",
			Self::Releases => "helmReleases",
		}
	}
}

impl fmt::Display for PayloadFamily {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Objects => "objects",
			Self::Trees => "trees",
			Self::Releases => "releases",
		};
		f.write_str(name)
	}
}

#[derive(Debug, Error)]
pub enum DeliveryError {
	#[error("failed serializing {family} payload")]
	Serialize {
		family: PayloadFamily,
		#[source]
		source: serde_json::Error,
	},

	#[error("failed sending {family} page {page}")]
	Send {
		family: PayloadFamily,
		page: usize,
		#[source]
		source: ClientError,
	},

	#[error("{family} page envelope takes {overhead} bytes, leaving nothing of the {budget} byte budget")]
	Overhead {
		family: PayloadFamily,
		overhead: usize,
		budget: usize,
	},

	#[error("{family} upload worker failed")]
	Worker {
		family: PayloadFamily,
		#[source]
		source: tokio::task::JoinError,
	},
}

impl DeliveryError {
	pub fn family(&self) -> PayloadFamily {
		match self {
			Self::Serialize { family, .. }
			| Self::Send { family, .. }
			| Self::Overhead { family, .. }
			| Self::Worker { family, .. } => *family,
		}
	}
}

#[derive(Debug, Error)]
#[error("failed committing fetch session {fetching_id}")]
pub struct CommitError {
	pub fetching_id: String,
	#[source]
	pub source: ClientError,
}

/// Items of one family, serialized once up front.
#[derive(Debug)]
pub struct FamilyPayload {
	family: PayloadFamily,
	items: Vec<Box<RawValue>>,
	extras: Vec<(&'static str, Box<RawValue>)>,
}

impl FamilyPayload {
	pub fn new<'a, T, I>(family: PayloadFamily, items: I) -> Result<Self, DeliveryError>
	where
		T: Serialize + 'a,
		I: IntoIterator<Item = &'a T>,
	{
		let items = items
			.into_iter()
			.map(to_raw_value)
			.collect::<Result<_, _>>()
			.map_err(|source| DeliveryError::Serialize { family, source })?;
		Ok(Self {
			family,
			items,
			extras: Vec::new(),
		})
	}

	/// Attach a field repeated on every page of the family.
	pub fn with_extra<T: Serialize + ?Sized>(
		mut self,
		key: &'static str,
		value: &T,
	) -> Result<Self, DeliveryError> {
		let raw = to_raw_value(value).map_err(|source| DeliveryError::Serialize {
			family: self.family,
			source,
		})?;
		self.extras.push((key, raw));
		Ok(self)
	}

	pub fn family(&self) -> PayloadFamily {
		self.family
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}
}

/// Body of one page: `{"fetchingId": ..., <items key>: [...], <extras>...}`.
struct PageBody<'a> {
	fetching_id: &'a str,
	items_key: &'static str,
	items: &'a [Box<RawValue>],
	extras: &'a [(&'static str, Box<RawValue>)],
}

impl Serialize for PageBody<'_> {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut map = serializer.serialize_map(Some(2 + self.extras.len()))?;
		map.serialize_entry("fetchingId", self.fetching_id)?;
		map.serialize_entry(self.items_key, self.items)?;
		for (key, value) in self.extras {
			map.serialize_entry(key, value)?;
		}
		map.end()
	}
}

/// Outcome of delivering one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilySummary {
	pub family: PayloadFamily,
	pub pages: usize,
	pub items: usize,
	/// Items left out for exceeding the per-item cap.
	pub dropped: usize,
}

/// Delivers payload families for one session.
#[derive(Debug, Clone, Builder)]
pub struct Uploader {
	#[builder(into)]
	client: Arc<IngestClient>,
	#[builder(into)]
	session: Arc<Session>,
	limits: ChunkLimits,
	/// Pages in flight at once, at least one.
	#[builder(default = 50)]
	max_concurrency: usize,
}

impl Uploader {
	pub fn session(&self) -> &Session {
		&self.session
	}

	/// Page and post one family, waiting for every dispatched page.
	#[instrument(skip_all, fields(family = %payload.family, fetching_id = self.session.fetching_id()))]
	pub async fn send_family(&self, payload: FamilyPayload) -> Result<FamilySummary, DeliveryError> {
		let FamilyPayload {
			family,
			items,
			extras,
		} = payload;
		// Every page repeats the envelope, and each item costs one separator.
		let overhead = serde_json::to_vec(&PageBody {
			fetching_id: self.session.fetching_id(),
			items_key: family.items_key(),
			items: &[],
			extras: &extras,
		})
		.map_err(|source| DeliveryError::Serialize { family, source })?
		.len();
		let limits = self.limits.shrink(overhead);
		if !items.is_empty() && limits.budget() == 0 {
			return Err(DeliveryError::Overhead {
				family,
				overhead,
				budget: self.limits.budget(),
			});
		}

		let chunked = chunk(items, limits, |raw| raw.get().len() + 1);
		let dropped = chunked.dropped.len();

		if chunked.is_empty() {
			tracing::debug!(dropped, "nothing to send");
			return Ok(FamilySummary {
				family,
				pages: 0,
				items: 0,
				dropped,
			});
		}

		let extras = Arc::new(extras);
		let sem = Arc::new(Semaphore::new(self.max_concurrency.max(1)));
		let cancel = CancellationToken::new();
		let mut tasks = JoinSet::new();

		for (index, page) in chunked.chunks.into_iter().enumerate() {
			let page_no = index + 1;
			let permit = tokio::select! {
				biased;
				() = cancel.cancelled() => {
					tracing::debug!(page = page_no, "family failed, not dispatching remaining pages");
					break;
				}
				permit = Arc::clone(&sem).acquire_owned() => {
					permit.expect("semaphore closed")
				}
			};

			let client = Arc::clone(&self.client);
			let session = Arc::clone(&self.session);
			let extras = Arc::clone(&extras);
			let cancel = cancel.clone();
			tasks.spawn(async move {
				let _permit = permit;
				if cancel.is_cancelled() {
					return Ok(None);
				}

				let bytes = page.bytes();
				let items = page.into_items();
				let body = serde_json::to_vec(&PageBody {
					fetching_id: session.fetching_id(),
					items_key: family.items_key(),
					items: &items,
					extras: &extras,
				})
				.map_err(|source| DeliveryError::Serialize { family, source });
				let result = match body {
					Ok(body) => client
						.send_page(&session, family.path(), body)
						.await
						.map_err(|source| DeliveryError::Send {
							family,
							page: page_no,
							source,
						}),
					Err(e) => Err(e),
				};

				match result {
					Ok(()) => {
						tracing::debug!(page = page_no, items = items.len(), bytes, "sent page");
						Ok(Some(items.len()))
					}
					Err(e) => {
						cancel.cancel();
						Err(e)
					}
				}
			});
		}

		let mut first_error = None;
		let mut pages = 0;
		let mut sent = 0;
		while let Some(joined) = tasks.join_next().await {
			let error = match joined {
				Ok(Ok(Some(items))) => {
					pages += 1;
					sent += items;
					continue;
				}
				Ok(Ok(None)) => continue,
				Ok(Err(e)) => e,
				Err(source) => {
					cancel.cancel();
					DeliveryError::Worker { family, source }
				}
			};
			if first_error.is_none() {
				first_error = Some(error);
			}
		}

		if let Some(error) = first_error {
			tracing::error!(error = %error, pages_sent = pages, "family delivery failed");
			return Err(error);
		}

		tracing::info!(pages, items = sent, dropped, "family delivered");
		Ok(FamilySummary {
			family,
			pages,
			items: sent,
			dropped,
		})
	}

	/// Mark the session complete. Only called after every family succeeded.
	pub async fn commit(&self) -> Result<(), CommitError> {
		self.client
			.commit(&self.session)
			.await
			.map_err(|source| CommitError {
				fetching_id: self.session.fetching_id().to_owned(),
				source,
			})
	}
}

#[cfg(test)]
mod tests {
	use std::{
		io::Read as _,
		sync::Mutex,
		time::{Duration, Instant},
	};

	use assert_matches::assert_matches;
	use flate2::read::GzDecoder;
	use serde_json::{json, Value};
	use wiremock::{matchers::method, Mock, MockServer, Request, Respond, ResponseTemplate};

	use super::*;
	use crate::{config::Config, session::ClusterId};

	fn uploader(server: &MockServer, limits: ChunkLimits, max_concurrency: usize) -> Uploader {
		let client = IngestClient::new(&Config {
			endpoint: server.uri(),
			..Config::default()
		})
		.unwrap();
		Uploader::builder()
			.client(client)
			.session(Session::new(ClusterId::parse("prod").unwrap(), "uid", "token"))
			.limits(limits)
			.max_concurrency(max_concurrency)
			.build()
	}

	/// `{"fetchingId":"<32 hex digits>","k8sObjects":[]}`
	const OBJECTS_ENVELOPE: usize = r#"{"fetchingId":"","k8sObjects":[]}"#.len() + 32;

	fn inflate(request: &Request) -> String {
		let mut body = String::new();
		GzDecoder::new(request.body.as_slice())
			.read_to_string(&mut body)
			.unwrap();
		body
	}

	fn body_len(request: &Request) -> usize {
		inflate(request).len()
	}

	fn decode(request: &Request) -> Value {
		serde_json::from_str(&inflate(request)).unwrap()
	}

	#[test]
	fn test_page_body_shape() {
		let items = vec![to_raw_value(&json!({"a": 1})).unwrap()];
		let extras = vec![("k8sTypes", to_raw_value(&json!(["Pod"])).unwrap())];
		let body = serde_json::to_value(PageBody {
			fetching_id: "f",
			items_key: "helmReleases",
			items: &items,
			extras: &extras,
		})
		.unwrap();
		assert_eq!(
			body,
			json!({"fetchingId": "f", "helmReleases": [{"a": 1}], "k8sTypes": ["Pod"]})
		);
	}

	#[tokio::test]
	async fn test_pages_respect_budget_and_order() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(204))
			.mount(&server)
			.await;

		let items: Vec<String> = (0..40).map(|i| format!("item-{i:03}")).collect();
		// Each item serializes to 10 bytes plus a comma; 3 fit next to the envelope.
		let budget = OBJECTS_ENVELOPE + 35;
		let uploader = uploader(&server, ChunkLimits::new(budget, 1_000), 1);
		let payload = FamilyPayload::new(PayloadFamily::Objects, &items).unwrap();
		let summary = uploader.send_family(payload).await.unwrap();

		assert_eq!(summary.pages, 14);
		assert_eq!(summary.items, 40);

		let requests = server.received_requests().await.unwrap();
		let received: Vec<String> = requests
			.iter()
			.flat_map(|r| {
				assert!(body_len(r) <= budget, "page of {} bytes", body_len(r));
				let body = decode(r);
				assert_eq!(body["fetchingId"], uploader.session().fetching_id());
				let page = body["k8sObjects"].as_array().unwrap().clone();
				assert!(page.len() <= 3);
				page
			})
			.map(|v| v.as_str().unwrap().to_owned())
			.collect();
		assert_eq!(received, items);
	}

	#[tokio::test]
	async fn test_production_limits_bound_every_body() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(204))
			.mount(&server)
			.await;

		let config = Config::default();
		let budget = config.page_budget();
		let limits = ChunkLimits::new(budget, config.item_cap());
		// Sizes straddle the budget so some items are dropped and pages fill up.
		let items: Vec<Value> = (0..60)
			.map(|i| json!({"id": i, "blob": "x".repeat((i * 37_813) % (budget + budget / 4))}))
			.collect();
		let expected: Vec<u64> = items
			.iter()
			.filter(|item| serde_json::to_vec(item).unwrap().len() + OBJECTS_ENVELOPE + 1 <= budget)
			.map(|item| item["id"].as_u64().unwrap())
			.collect();

		let payload = FamilyPayload::new(PayloadFamily::Objects, &items).unwrap();
		let summary = uploader(&server, limits, 4)
			.send_family(payload)
			.await
			.unwrap();
		assert_eq!(summary.items, expected.len());
		assert_eq!(summary.dropped, items.len() - expected.len());
		assert!(summary.dropped > 0);

		let requests = server.received_requests().await.unwrap();
		assert_eq!(requests.len(), summary.pages);
		let mut received: Vec<u64> = requests
			.iter()
			.flat_map(|r| {
				assert!(body_len(r) <= budget, "page of {} bytes", body_len(r));
				decode(r)["k8sObjects"].as_array().unwrap().clone()
			})
			.map(|item| item["id"].as_u64().unwrap())
			.collect();
		// Pages finish in any order when several are in flight.
		received.sort_unstable();
		assert_eq!(received, expected);
	}

	#[tokio::test]
	async fn test_envelope_larger_than_budget_is_an_error() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(204))
			.expect(0)
			.mount(&server)
			.await;

		let payload = FamilyPayload::new(PayloadFamily::Objects, &[1u32, 2, 3]).unwrap();
		let err = uploader(&server, ChunkLimits::new(OBJECTS_ENVELOPE, 1_000), 1)
			.send_family(payload)
			.await
			.unwrap_err();
		assert_matches!(
			err,
			DeliveryError::Overhead {
				family: PayloadFamily::Objects,
				overhead: OBJECTS_ENVELOPE,
				..
			}
		);
	}

	#[tokio::test]
	async fn test_empty_family_sends_nothing() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(204))
			.expect(0)
			.mount(&server)
			.await;

		let payload = FamilyPayload::new::<String, _>(PayloadFamily::Trees, &[]).unwrap();
		let summary = uploader(&server, ChunkLimits::new(100, 100), 4)
			.send_family(payload)
			.await
			.unwrap();
		assert_eq!(summary.pages, 0);
	}

	/// Records when each page arrives and answers after a fixed delay.
	struct SlowIngest {
		arrivals: Arc<Mutex<Vec<Instant>>>,
		delay: Duration,
	}

	impl Respond for SlowIngest {
		fn respond(&self, _request: &Request) -> ResponseTemplate {
			self.arrivals.lock().unwrap().push(Instant::now());
			ResponseTemplate::new(204).set_delay(self.delay)
		}
	}

	#[tokio::test]
	async fn test_in_flight_pages_never_exceed_max_concurrency() {
		let server = MockServer::start().await;
		let arrivals = Arc::new(Mutex::new(Vec::new()));
		let delay = Duration::from_millis(150);
		Mock::given(method("POST"))
			.respond_with(SlowIngest {
				arrivals: Arc::clone(&arrivals),
				delay,
			})
			.mount(&server)
			.await;

		let items: Vec<u32> = (0..12).collect();
		let payload = FamilyPayload::new(PayloadFamily::Objects, &items).unwrap();
		// One item per page.
		let summary = uploader(&server, ChunkLimits::new(OBJECTS_ENVELOPE + 3, 100), 3)
			.send_family(payload)
			.await
			.unwrap();
		assert_eq!(summary.pages, 12);

		// A page holds its permit until its response arrives, at least `delay`
		// after the request did, so pages arriving within `delay` of each other
		// were in flight together.
		let arrivals = arrivals.lock().unwrap().clone();
		assert_eq!(arrivals.len(), 12);
		let peak = arrivals
			.iter()
			.map(|&at| {
				arrivals
					.iter()
					.filter(|&&other| other <= at && at.duration_since(other) < delay)
					.count()
			})
			.max()
			.unwrap();
		assert!(peak <= 3, "{peak} pages in flight");
		assert!(peak > 1, "pages were sent one at a time");
	}

	#[tokio::test]
	async fn test_first_failure_stops_dispatch() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;

		let items: Vec<u32> = (0..10).collect();
		let payload = FamilyPayload::new(PayloadFamily::Objects, &items).unwrap();
		let err = uploader(&server, ChunkLimits::new(OBJECTS_ENVELOPE + 3, 100), 1)
			.send_family(payload)
			.await
			.unwrap_err();

		assert_matches!(
			err,
			DeliveryError::Send {
				family: PayloadFamily::Objects,
				page: 1,
				..
			}
		);
		assert_eq!(server.received_requests().await.unwrap().len(), 1);
	}
}
