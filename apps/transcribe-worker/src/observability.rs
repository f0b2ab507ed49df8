use anyhow::Result;
use opentelemetry::trace::TracerProvider;
use opentelemetry::{
	global,
	metrics::{Counter, Histogram, Meter},
	KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
	metrics::{PeriodicReader, SdkMeterProvider},
	trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
	Resource,
};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Metrics for the transcription worker
#[derive(Clone)]
pub struct WorkerMetrics {
	// Counters
	pub deliveries_received: Counter<u64>,
	pub deliveries_rejected: Counter<u64>,
	pub deliveries_duplicate: Counter<u64>,
	pub tasks_completed: Counter<u64>,
	pub tasks_failed: Counter<u64>,
	pub tasks_cancelled: Counter<u64>,
	pub memory_pressure_warnings: Counter<u64>,

	// Histograms
	pub slot_wait_latency: Histogram<f64>,
	pub decode_latency: Histogram<f64>,
	pub inference_latency: Histogram<f64>,
}

impl WorkerMetrics {
	pub fn new(meter: &Meter) -> Self {
		Self {
			// Counters
			deliveries_received: meter
				.u64_counter("worker.deliveries.received")
				.with_description("Total task commands received from the queue")
				.build(),
			deliveries_rejected: meter
				.u64_counter("worker.deliveries.rejected")
				.with_description("Total queue payloads that could not be decoded")
				.build(),
			deliveries_duplicate: meter
				.u64_counter("worker.deliveries.duplicate")
				.with_description("Total redeliveries that were no-ops (terminal or in-flight task)")
				.build(),
			tasks_completed: meter.u64_counter("worker.tasks.completed").with_description("Total tasks completed successfully").build(),
			tasks_failed: meter.u64_counter("worker.tasks.failed").with_description("Total tasks that ended in FAILED").build(),
			tasks_cancelled: meter.u64_counter("worker.tasks.cancelled").with_description("Total tasks cancelled cooperatively").build(),
			memory_pressure_warnings: meter
				.u64_counter("worker.memory.pressure_warnings")
				.with_description("Total memory pressure warnings emitted by the monitor")
				.build(),

			// Histograms
			slot_wait_latency: meter
				.f64_histogram("worker.slots.wait_latency")
				.with_description("Time spent waiting for an execution slot (ms)")
				.build(),
			decode_latency: meter
				.f64_histogram("worker.decode.latency")
				.with_description("Time to decode and normalize source audio (ms)")
				.build(),
			inference_latency: meter
				.f64_histogram("worker.inference.latency")
				.with_description("Time to run model inference (ms)")
				.build(),
		}
	}
}

/// Initialize OpenTelemetry with OTLP exporters
pub fn init_observability(service_name: &str) -> Result<(SdkMeterProvider, WorkerMetrics)> {
	// Get OTLP endpoint from env (default to localhost)
	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|_| "http://localhost:4317".to_string());

	info!("🔧 Initializing OpenTelemetry");
	info!("   Service: {}", service_name);
	info!("   OTLP Endpoint: {}", otlp_endpoint);

	// Resource with service metadata
	let resource = Resource::builder()
		.with_service_name(service_name.to_string())
		.with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
		.build();

	// Traces
	let span_exporter = opentelemetry_otlp::SpanExporter::builder().with_tonic().with_endpoint(&otlp_endpoint).build()?;

	let tracer_provider = SdkTracerProvider::builder()
		.with_batch_exporter(span_exporter)
		.with_sampler(Sampler::AlwaysOn)
		.with_id_generator(RandomIdGenerator::default())
		.with_resource(resource.clone())
		.build();

	let tracer = tracer_provider.tracer("transcribe-worker");
	global::set_tracer_provider(tracer_provider);

	// Metrics
	let metric_exporter = opentelemetry_otlp::MetricExporter::builder().with_tonic().with_endpoint(&otlp_endpoint).build()?;

	let reader = PeriodicReader::builder(metric_exporter).with_interval(Duration::from_secs(10)).build();

	let meter_provider = SdkMeterProvider::builder().with_resource(resource).with_reader(reader).build();

	global::set_meter_provider(meter_provider.clone());

	let meter = global::meter_with_scope(opentelemetry::InstrumentationScope::builder(service_name.to_owned()).build());
	let metrics = WorkerMetrics::new(&meter);

	// Tracing subscriber with the OpenTelemetry layer
	let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,transcribe_worker=debug"));

	tracing_subscriber::registry()
		.with(env_filter)
		.with(telemetry_layer)
		.with(tracing_subscriber::fmt::layer().with_target(true))
		.init();

	info!("✅ OpenTelemetry initialized successfully");

	Ok((meter_provider, metrics))
}

/// Create local-only metrics when OTLP export fails.
/// The worker keeps running; nothing leaves the process.
pub fn create_local_metrics() -> WorkerMetrics {
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,transcribe_worker=debug"));

	tracing_subscriber::registry().with(env_filter).with(tracing_subscriber::fmt::layer().with_target(true)).init();

	// Metrics are tracked but not exported
	let meter = global::meter("transcribe-worker-local");
	WorkerMetrics::new(&meter)
}
