//! Service façade — implements the generated `Tika` gRPC trait, validates
//! requests, and routes to the registry, dispatcher, or stream
//! coordinator. Owns the domain <-> wire conversions so nothing upstream
//! needs to know about `prost`-generated types.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::warn;

use tika_pipes_proto::tika::v1::{
    tika_server::Tika, DeleteFetcherReply, DeleteFetcherRequest, Empty, FetchAndParseReply,
    FetchAndParseRequest, GetFetcherReply, GetFetcherRequest, ListFetchersReply,
    SaveFetcherReply, SaveFetcherRequest,
};

use crate::dispatch::Dispatcher;
use crate::domain::{FetchReply, FetchRequest};
use crate::registry::{FetcherRegistry, RegistryError};
use crate::stream::{run_stream, StreamConfig, StreamError};

pub struct TikaService {
    registry: FetcherRegistry,
    dispatcher: Dispatcher,
    stream_config: StreamConfig,
}

impl TikaService {
    pub fn new(registry: FetcherRegistry, dispatcher: Dispatcher, stream_config: StreamConfig) -> Self {
        Self {
            registry,
            dispatcher,
            stream_config,
        }
    }
}

#[tonic::async_trait]
impl Tika for TikaService {
    async fn save_fetcher(
        &self,
        request: Request<SaveFetcherRequest>,
    ) -> Result<Response<SaveFetcherReply>, Status> {
        let req = request.into_inner();
        self.registry
            .save(&req.fetcher_id, &req.fetcher_class, &req.fetcher_config_json)
            .map_err(registry_error_to_status)?;
        Ok(Response::new(SaveFetcherReply {
            fetcher_id: req.fetcher_id,
        }))
    }

    async fn get_fetcher(
        &self,
        request: Request<GetFetcherRequest>,
    ) -> Result<Response<GetFetcherReply>, Status> {
        let req = request.into_inner();
        match self.registry.get(&req.fetcher_id) {
            Some(info) => Ok(Response::new(GetFetcherReply {
                fetcher_id: info.fetcher_id,
                fetcher_class: info.fetcher_class,
                params: info.params,
            })),
            None => Err(Status::not_found(format!(
                "unknown or expired fetcherId: {}",
                req.fetcher_id
            ))),
        }
    }

    async fn delete_fetcher(
        &self,
        request: Request<DeleteFetcherRequest>,
    ) -> Result<Response<DeleteFetcherReply>, Status> {
        let req = request.into_inner();
        let success = self.registry.delete(&req.fetcher_id);
        Ok(Response::new(DeleteFetcherReply { success }))
    }

    async fn list_fetchers(&self, _request: Request<Empty>) -> Result<Response<ListFetchersReply>, Status> {
        let fetchers = self
            .registry
            .list()
            .into_iter()
            .map(|info| GetFetcherReply {
                fetcher_id: info.fetcher_id,
                fetcher_class: info.fetcher_class,
                params: info.params,
            })
            .collect();
        Ok(Response::new(ListFetchersReply { fetchers }))
    }

    async fn fetch_and_parse(
        &self,
        request: Request<FetchAndParseRequest>,
    ) -> Result<Response<FetchAndParseReply>, Status> {
        let req = proto_to_domain(request.into_inner());
        // Unary calls have no cancellation signal plumbed through from the
        // transport today; the dispatcher still enforces the configured
        // timeout ceiling regardless.
        let (_tx, cancelled) = watch::channel(false);
        let reply = self.dispatcher.dispatch(req, None, cancelled).await;
        Ok(Response::new(domain_to_proto(reply)))
    }

    type FetchAndParseBiDirectionalStreamingStream =
        Pin<Box<dyn Stream<Item = Result<FetchAndParseReply, Status>> + Send>>;

    async fn fetch_and_parse_bi_directional_streaming(
        &self,
        request: Request<tonic::Streaming<FetchAndParseRequest>>,
    ) -> Result<Response<Self::FetchAndParseBiDirectionalStreamingStream>, Status> {
        let inbound = request
            .into_inner()
            .map(|item| item.map(proto_to_domain).map_err(|status| status.message().to_string()));

        let capacity = self.stream_config.in_flight_capacity.max(1);
        let (domain_tx, mut domain_rx) = mpsc::channel::<FetchReply>(capacity);
        let (proto_tx, proto_rx) = mpsc::channel::<Result<FetchAndParseReply, Status>>(capacity);

        let dispatcher = self.dispatcher.clone();
        let stream_config = self.stream_config;
        let error_tx = proto_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_stream(dispatcher, stream_config, inbound, domain_tx).await {
                warn!(error = %e, "bidi stream terminated with a transport-level error");
                let _ = error_tx.send(Err(stream_error_to_status(e))).await;
            }
        });
        tokio::spawn(async move {
            while let Some(reply) = domain_rx.recv().await {
                if proto_tx.send(Ok(domain_to_proto(reply))).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(proto_rx))))
    }
}

fn registry_error_to_status(e: RegistryError) -> Status {
    match e {
        RegistryError::EmptyFetcherId => Status::invalid_argument(e.to_string()),
        RegistryError::UnknownPluginFamily(_) => Status::invalid_argument(e.to_string()),
    }
}

fn stream_error_to_status(e: StreamError) -> Status {
    match e {
        StreamError::Inbound(msg) => Status::cancelled(msg),
        StreamError::Outbound(msg) => Status::unavailable(msg),
    }
}

fn proto_to_domain(req: FetchAndParseRequest) -> FetchRequest {
    FetchRequest {
        fetcher_id: req.fetcher_id,
        fetch_key: req.fetch_key,
        metadata: req.metadata,
        request_id: req.request_id,
    }
}

fn domain_to_proto(reply: FetchReply) -> FetchAndParseReply {
    FetchAndParseReply {
        fetch_key: reply.fetch_key,
        status: reply.status.as_str().to_string(),
        fields: reply.fields,
        error_message: reply.error_message,
        request_id: reply.request_id,
    }
}
