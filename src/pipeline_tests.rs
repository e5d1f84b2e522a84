//! End-to-end runs over a temporary project directory.

#[cfg(test)]
mod tests {
    use crate::config::CompileOptions;
    use crate::error::ERR_UNDEFINED_SYMBOL;
    use crate::pipeline::run;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::Path;

    const METABASE: &str = r#"{
        "classes": {
            "UIView": {
                "framework": "UIKit",
                "methods": {
                    "setNeedsLayout": [ { "returnType": "void", "args": [] } ]
                },
                "properties": {
                    "tag": { "type": "int" }
                }
            }
        },
        "types": {
            "CGPoint": { "type": "struct CGPoint" },
            "struct CGPoint": {
                "type": "struct CGPoint",
                "fields": [ { "name": "x", "type": "double" }, { "name": "y", "type": "double" } ]
            }
        },
        "functions": {
            "CGPointMake": {
                "returnType": "CGPoint",
                "arguments": [ { "type": "double" }, { "type": "double" } ]
            }
        }
    }"#;

    fn project(root: &Path) -> CompileOptions {
        let src = root.join("src");
        fs::create_dir_all(src.join("lib")).unwrap();
        fs::write(
            src.join("app.js"),
            "'use hyperloop';\nvar point = CGPointMake(10, 20);\nvar view = new UIView();\nview.tag = 4;\nview.setNeedsLayout();\n",
        )
        .unwrap();
        fs::write(src.join("lib/util.js"), "module.exports = { twice: function (x) { return x * 2; } };\n").unwrap();
        fs::write(src.join("settings.json"), "{\"theme\": \"dark\"}").unwrap();

        let metabase = root.join("arm64.json");
        fs::write(&metabase, METABASE).unwrap();

        let mut options = CompileOptions {
            src,
            dest: root.join("build"),
            module_id: Some("com.example.app".to_string()),
            ..CompileOptions::default()
        };
        options.metabase.insert("arm64".to_string(), metabase);
        options
    }

    #[test]
    fn test_full_run_writes_units() {
        let dir = tempfile::tempdir().unwrap();
        let options = project(dir.path());

        let reports = run(&options).unwrap();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.arch, "arm64");
        assert_eq!(report.native_files, 1);
        assert_eq!(report.embedded_files, 2);
        assert_eq!(report.cache_hits, 0);
        assert_eq!(report.compiled, 0);

        let out = options.arch_dir("arm64");
        for name in [
            "hyperloop.h",
            "HyperloopFunctions.cpp",
            "UIView.cpp",
            "js_app.cpp",
            "HL_jscode.cpp",
            "srccache.json",
        ] {
            assert!(out.join(name).exists(), "missing {}", name);
        }

        let embed = fs::read_to_string(out.join("HL_jscode.cpp")).unwrap();
        assert!(embed.contains("\"lib/util.js\""));
        assert!(embed.contains("\"settings.json\""));
        assert!(!embed.contains("if (fn == \"app.js\")"));
        assert!(embed.contains("HyperloopRegisterLoader(\"app.js\",HyperloopLoad_app);"));

        let header = fs::read_to_string(out.join("hyperloop.h")).unwrap();
        assert!(header.contains("HyperloopInitialize_com_example_app"));
    }

    #[test]
    fn test_second_run_is_all_cache_hits() {
        let dir = tempfile::tempdir().unwrap();
        let options = project(dir.path());

        let first = run(&options).unwrap();
        let header = options.arch_dir("arm64").join("hyperloop.h");
        let before = fs::read_to_string(&header).unwrap();

        let second = run(&options).unwrap();
        assert_eq!(second[0].units, first[0].units);
        assert_eq!(second[0].cache_hits, second[0].units);
        assert_eq!(fs::read_to_string(&header).unwrap(), before);

        let forced = CompileOptions {
            force: true,
            ..options.clone()
        };
        assert_eq!(run(&forced).unwrap()[0].cache_hits, 0);
    }

    #[test]
    fn test_deleted_source_leaves_cache() {
        let dir = tempfile::tempdir().unwrap();
        let options = project(dir.path());
        let extra = options.src.join("lib/extra.js");
        fs::write(&extra, "'use hyperloop';\nvar view = new UIView();\nview.tag = 1;\n").unwrap();

        run(&options).unwrap();
        let out = options.arch_dir("arm64");
        let unit = out.join("js_lib_extra.cpp");
        assert!(unit.exists());
        let recorded = fs::read_to_string(out.join("srccache.json")).unwrap();
        assert!(recorded.contains("js_lib_extra.cpp"));

        fs::remove_file(&extra).unwrap();
        let reports = run(&options).unwrap();
        assert_eq!(reports[0].native_files, 1);
        assert!(!unit.exists());
        let cache: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.join("srccache.json")).unwrap()).unwrap();
        let entries = cache["entries"].as_object().unwrap();
        assert!(entries.keys().all(|k| !k.contains("js_lib_extra")));
        assert!(entries.keys().any(|k| k.ends_with("js_app.cpp")));
    }

    #[test]
    fn test_ir_dump() {
        let dir = tempfile::tempdir().unwrap();
        let options = CompileOptions {
            dump_ir: true,
            dump_ast: true,
            ..project(dir.path())
        };
        run(&options).unwrap();

        let out = options.arch_dir("arm64");
        let dump: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.join("ir/app.json")).unwrap()).unwrap();
        let first = &dump["nodes"][0];
        assert_eq!(first["nodetype"], "assignment");
        assert_eq!(first["name"], "point");
        assert_eq!(first["expression"]["arguments"].as_array().map(Vec::len), Some(2));
        assert_eq!(first["expression"]["arguments"][0]["metatype"], "value");

        let ast = fs::read_to_string(out.join("ast/app.js")).unwrap();
        assert!(ast.contains("CGPointMake_function"));
        assert!(!out.join("ir/lib_util.json").exists());
    }

    #[test]
    fn test_failing_arch_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = project(dir.path());
        options
            .metabase
            .insert("x86_64".to_string(), dir.path().join("missing.json"));

        assert!(run(&options).is_err());
        assert!(options.arch_dir("arm64").join("hyperloop.h").exists());
        assert!(!options.arch_dir("x86_64").join("hyperloop.h").exists());

        options.arch = vec!["arm64".to_string()];
        assert_eq!(run(&options).unwrap().len(), 1);
    }

    #[test]
    fn test_undefined_symbol_aborts_arch() {
        let dir = tempfile::tempdir().unwrap();
        let options = project(dir.path());
        fs::write(
            options.src.join("broken.js"),
            "'use hyperloop';\nvar v = new UIView();\nUIViewMissing(v);\n",
        )
        .unwrap();

        let err = run(&options).unwrap_err();
        assert_eq!(err.code, ERR_UNDEFINED_SYMBOL);
        assert_eq!(err.file, "broken.js");
        assert_eq!(err.line, 3);
        assert!(!options.arch_dir("arm64").join("hyperloop.h").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_toolchain_runs_for_written_units() {
        let dir = tempfile::tempdir().unwrap();
        let options = CompileOptions {
            compiler: Some("true".to_string()),
            jobs: 2,
            ..project(dir.path())
        };
        let reports = run(&options).unwrap();
        assert!(reports[0].compiled > 0);
        assert!(reports[0].compiled < reports[0].units);
    }
}
