#![forbid(unsafe_code)]

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use isf_core::{
        BuildError, EngineConfig, EngineError, ParseError, PersistencePolicy, RenderError,
        ResourceError, ShaderStage,
    };
    use isf_doc::{parse, validate, validate_source};
    use isf_runtime::headless::{Fragment, HeadlessBackend};
    use isf_runtime::{EngineInstance, FrameContext, ParamValue};

    // ---- Golden fixtures (ISF documents) ----
    const SOLID_RED: &str = include_str!("../fixtures/solid_red.fs");
    const PASSTHROUGH: &str = include_str!("../fixtures/passthrough.fs");
    const FEEDBACK_COPY: &str = include_str!("../fixtures/feedback_copy.fs");
    const MULTIPASS: &str = include_str!("../fixtures/multipass.fs");
    const DUPLICATE_INPUTS: &str = include_str!("../fixtures/duplicate_inputs.fs");
    const UNRESOLVED_IMAGE: &str = include_str!("../fixtures/unresolved_image.fs");
    const MISSING_IMAGE_INPUT: &str = include_str!("../fixtures/missing_image_input.fs");
    const BAD_JSON: &str = include_str!("../fixtures/bad_json.fs");
    const PARAMS: &str = include_str!("../fixtures/params.fs");
    const ENGINE_SESSION_JSON: &str = include_str!("../fixtures/engine_session.json");

    const WELL_FORMED: [(&str, &str); 5] = [
        ("solid_red", SOLID_RED),
        ("passthrough", PASSTHROUGH),
        ("feedback_copy", FEEDBACK_COPY),
        ("multipass", MULTIPASS),
        ("params", PARAMS),
    ];

    fn write_temp_fixture(name: &str, contents: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis();
        p.push(format!("isf_contract_tests_{name}_{ts}.json"));
        fs::write(&p, contents).expect("write fixture");
        p
    }

    fn init_logs() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
            .try_init();
    }

    fn copy_input(f: &Fragment<'_>) -> [f32; 4] {
        f.this_pixel("inputImage")
    }

    fn two_pass(f: &Fragment<'_>) -> [f32; 4] {
        if f.pass_index() == 0 {
            [0.0, 1.0, 0.0, 1.0]
        } else {
            f.sample("small", f.coord)
        }
    }

    fn tint_level(f: &Fragment<'_>) -> [f32; 4] {
        let level = f.float("level");
        let c = f.vec4("tint").map(|t| t * level);
        if f.bool("invert") {
            c.map(|v| 1.0 - v)
        } else {
            c
        }
    }

    /// Headless backend with a kernel for every fixture that is not a constant color.
    fn backend() -> HeadlessBackend {
        HeadlessBackend::new()
            .with_kernel("IMG_THIS_PIXEL(inputImage)", copy_input)
            .with_kernel("IMG_THIS_PIXEL(history)", |f| f.this_pixel("history"))
            .with_kernel("IMG_THIS_PIXEL(maskImage)", |f| f.this_pixel("maskImage"))
            .with_kernel("PASSINDEX == 0", two_pass)
            .with_kernel("tint * level", tint_level)
    }

    fn engine() -> EngineInstance<HeadlessBackend> {
        init_logs();
        EngineInstance::new(backend(), EngineConfig::default()).expect("headless engine")
    }

    fn no_params() -> HashMap<String, ParamValue> {
        HashMap::new()
    }

    // ---- Validation ----

    #[test]
    fn well_formed_fixtures_validate_clean() {
        for (name, text) in WELL_FORMED {
            let report = validate_source(text);
            assert!(report.is_valid, "{name}: {:?}", report.errors);
            assert!(report.errors.is_empty(), "{name}");
        }
    }

    #[test]
    fn duplicate_input_is_reported_by_name() {
        let report = validate_source(DUPLICATE_INPUTS);
        assert!(!report.is_valid);
        assert!(
            report.errors.iter().any(|e| e.contains("duplicate") && e.contains("amount")),
            "{:?}",
            report.errors
        );
    }

    #[test]
    fn malformed_header_never_panics() {
        let report = validate_source(BAD_JSON);
        assert!(!report.is_valid);
        assert!(!report.errors.is_empty());

        let err = parse(BAD_JSON).unwrap_err();
        let ParseError::Json { offset, .. } = err else {
            panic!("expected a JSON error, got {err:?}");
        };
        assert!(offset > 0 && offset < BAD_JSON.find("*/").unwrap());
    }

    #[test]
    fn validation_does_not_mutate_the_document() {
        let doc = parse(PARAMS).unwrap();
        let before = doc.clone();
        let _ = validate(&doc);
        assert_eq!(doc, before);
    }

    #[test]
    fn validation_runs_concurrently() {
        let sequential: Vec<_> = WELL_FORMED.iter().map(|(_, t)| validate_source(t)).collect();
        let parallel: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = WELL_FORMED
                .iter()
                .map(|(_, t)| s.spawn(move || validate_source(t)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(sequential, parallel);
    }

    // ---- Graph ----

    #[test]
    fn undeclared_sampler_is_unresolved() {
        let doc = parse(UNRESOLVED_IMAGE).unwrap();
        assert_eq!(
            isf_graph::build(&doc).unwrap_err(),
            BuildError::UnresolvedBinding("inputImg".into())
        );
        assert!(!validate(&doc).is_valid);
    }

    #[test]
    fn declared_but_unsupplied_image_builds() {
        let doc = parse(MISSING_IMAGE_INPUT).unwrap();
        let graph = isf_graph::build(&doc).unwrap();
        assert_eq!(graph.host_images(), ["maskImage"]);
    }

    // ---- Rendering ----

    #[test]
    fn solid_red_renders_4x4() {
        let mut e = engine();
        let img = e.render_shader(SOLID_RED, 4, 4, &no_params()).unwrap();
        assert_eq!((img.width, img.height, img.format_name()), (4, 4, "RGBA"));
        assert_eq!(img.bytes.len(), 4 * 4 * 4);
        assert!(img.bytes.chunks(4).all(|p| p == [255, 0, 0, 255]));
    }

    #[test]
    fn texture_round_trips_byte_identical() {
        let mut e = engine();
        let (w, h) = (5, 3);
        let bytes: Vec<u8> = (0..w * h * 4).map(|i| (i * 37 % 251) as u8).collect();
        let id = e.create_texture(&bytes, w, h, "RGBA").unwrap();

        let params = HashMap::from([(
            "inputImage".to_string(),
            ParamValue::Image(id.parse().unwrap()),
        )]);
        let img = e.render_shader(PASSTHROUGH, w, h, &params).unwrap();
        assert_eq!(img.bytes, bytes);
    }

    #[test]
    fn destroy_twice_is_not_found() {
        let mut e = engine();
        let id = e.create_texture(&[1, 2, 3, 4], 1, 1, "RGBA").unwrap();
        e.destroy_texture(&id).unwrap();
        let err = e.destroy_texture(&id).unwrap_err();
        assert!(matches!(err, EngineError::Resource(ResourceError::NotFound(_))));
        assert!(e.is_initialized());
    }

    #[test]
    fn feedback_copy_is_stable_across_frames() {
        let mut e = engine();
        let h = e.open_document(FEEDBACK_COPY).unwrap();
        let first = e.render_frame(h, FrameContext::new(3, 2), &no_params()).unwrap();
        assert!(first.bytes.iter().all(|b| *b == 0));

        for n in 1..6u64 {
            let ctx = FrameContext::new(3, 2).at(n as f64 / 60.0, n);
            let frame = e.render_frame(h, ctx, &no_params()).unwrap();
            assert_eq!(frame, first, "frame {n}");
        }
    }

    #[test]
    fn multipass_scales_intermediate_target() {
        let mut e = engine();
        let img = e.render_shader(MULTIPASS, 4, 4, &no_params()).unwrap();
        assert_eq!((img.width, img.height), (4, 4));
        assert!(img.bytes.chunks(4).all(|p| p == [0, 255, 0, 255]));
    }

    #[test]
    fn missing_image_policy_follows_config() {
        let mut lenient = engine();
        let img = lenient
            .render_shader(MISSING_IMAGE_INPUT, 2, 2, &no_params())
            .unwrap();
        assert!(img.bytes.iter().all(|b| *b == 0));

        let cfg = EngineConfig {
            placeholder_missing_images: false,
            ..EngineConfig::default()
        };
        let mut strict = EngineInstance::new(backend(), cfg).unwrap();
        let err = strict
            .render_shader(MISSING_IMAGE_INPUT, 2, 2, &no_params())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Render(RenderError::MissingImage(ref n)) if n == "maskImage"
        ));
    }

    // ---- Pipeline cache ----

    #[test]
    fn reopening_a_document_hits_the_cache() {
        let mut e = engine();
        let a = e.open_document(MULTIPASS).unwrap();
        let b = e.open_document(MULTIPASS).unwrap();
        assert_ne!(a, b);

        let stats = e.pipeline_stats();
        assert_eq!(stats.programs_compiled, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 2);
        assert_eq!(e.backend().compile_count(), 1);
    }

    #[test]
    fn compile_failure_keeps_driver_log_and_registers_nothing() {
        let mut e = engine();
        let broken = SOLID_RED.replace(
            "gl_FragColor = vec4(1.0, 0.0, 0.0, 1.0);",
            "#error missing semicolon",
        );
        let err = e.open_document(&broken).unwrap_err();
        let EngineError::Compile(c) = err else {
            panic!("expected a compile error, got {err:?}");
        };
        assert_eq!(c.pass_index, 0);
        assert_eq!(c.stage, ShaderStage::Fragment);
        assert_eq!(c.log, "0:9(1): error: #error missing semicolon\n");

        assert_eq!(e.pipeline_stats().programs_compiled, 0);
        assert_eq!(e.backend().live_programs(), 0);
        assert_eq!(e.open_document_count(), 0);

        // Other documents are unaffected.
        e.render_shader(SOLID_RED, 1, 1, &no_params()).unwrap();
    }

    // ---- Instance lifecycle ----

    #[test]
    fn context_loss_requires_a_new_instance() {
        let mut e = engine();
        let h = e.open_document(SOLID_RED).unwrap();
        e.backend_mut().set_context_lost(true);

        let err = e.render_frame(h, FrameContext::new(1, 1), &no_params()).unwrap_err();
        assert!(err.is_fatal());
        assert!(!e.is_initialized());
        assert!(matches!(
            e.open_document(SOLID_RED),
            Err(EngineError::NotInitialized)
        ));

        let mut fresh = engine();
        assert!(fresh.render_shader(SOLID_RED, 1, 1, &no_params()).is_ok());
    }

    #[test]
    fn parameters_serialize_for_the_host() {
        let mut e = engine();
        let info = e.get_parameters(PARAMS).unwrap();
        let json = serde_json::to_value(&info).unwrap();

        let by_name: HashMap<&str, &serde_json::Value> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|p| (p["name"].as_str().unwrap(), p))
            .collect();
        assert_eq!(by_name.len(), 6);
        assert_eq!(by_name["level"]["type"], "float");
        assert_eq!(by_name["level"]["max"], 1.0);
        assert_eq!(by_name["mode"]["labels"][2], "Hard");
        assert_eq!(by_name["tint"]["default"][1], 0.5);
        assert_eq!(by_name["trigger"]["type"], "event");
    }

    #[test]
    fn session_parameters_coerce_from_json() {
        let mut e = engine();
        let h = e.open_document(PARAMS).unwrap();
        let none = HashMap::new();
        let img = e.render_frame(h, FrameContext::new(1, 1), &none).unwrap();
        assert_eq!(img.bytes, vec![128, 64, 0, 128]);

        e.set_parameter_json(h, "level", &serde_json::json!(1)).unwrap();
        e.set_parameter_json(h, "invert", &serde_json::json!(true)).unwrap();
        let img = e.render_frame(h, FrameContext::new(1, 1).at(0.1, 1), &none).unwrap();
        assert_eq!(img.bytes, vec![0, 128, 255, 0]);

        e.set_parameter_json(h, "center", &serde_json::json!({ "x": 0.25, "y": 0.75 }))
            .unwrap();
        e.set_parameter_json(h, "mode", &serde_json::json!(2)).unwrap();

        let err = e
            .set_parameter_json(h, "mode", &serde_json::json!(7))
            .unwrap_err();
        assert!(err.to_string().contains("VALUES"), "{err}");
        assert_eq!(e.last_error(), err.to_string());
    }

    #[test]
    fn config_fixture_loads() {
        let path = write_temp_fixture("engine_session", ENGINE_SESSION_JSON);
        let cfg = EngineConfig::load_from(&path).expect("engine_session.json should load");
        assert_eq!(cfg.persistence, PersistencePolicy::Session);
        assert_eq!(cfg.glsl_version, "410 core");
        assert!(!cfg.placeholder_missing_images);
        let _ = fs::remove_file(path);
    }
}
