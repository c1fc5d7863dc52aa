use super::*;
use crate::core::fixtures::*;
use crate::core::plan::{build_plan, Direction, Layered, Transfer};
use crate::core::script::Script;
use crate::core::topology::{Address, Topology};

fn cert(path: &str) -> Content {
    Content::LocalFile(PathBuf::from(path))
}

fn file(path: &str) -> Destination {
    Destination::File {
        path: path.into(),
        mode: 0o600,
    }
}

/// Transfers in plan order as `(direction, far end, sources, destination)`.
fn copies<'a>(t: &'a Topology, transfers: Vec<&'a Transfer>) -> Vec<(Direction, &'a str, Vec<String>, String)> {
    transfers
        .into_iter()
        .map(|tr| {
            (
                tr.direction,
                t.node(tr.node).name.as_str(),
                tr.sources.clone(),
                tr.destination.clone(),
            )
        })
        .collect()
}

mod distribute {
    use super::*;

    #[test]
    fn relays_through_every_non_local_ancestor() {
        let t = scenario_c();
        let gate = t.find(&["region-2", "gate-1"]).unwrap().id;
        let artifact = Artifact::new(ArtifactKind::CertificateBundle, "certs").place(
            gate,
            "ca.crt",
            cert("/pki/ca.crt"),
            file("/opt/fleet/certificates/ca.crt"),
        );
        let distribution = distribute(&artifact, &t).unwrap();
        let plan = build_plan(&t, &distribution, &credentials()).unwrap();

        let staged = ".tierdeploy-certs-ca.crt".to_string();
        assert_eq!(
            vec![
                (Direction::Upload, "hq", vec!["/pki/ca.crt".to_string()], staged.clone()),
                (Direction::Upload, "region-2", vec![staged.clone()], staged.clone()),
                (Direction::Upload, "gate-1", vec![staged.clone()], staged.clone()),
            ],
            copies(&t, plan.transfers()),
        );
        assert_eq!(3, distribution.hops(&t, gate));
        assert_eq!(locality::copy_chain(&t, gate).len(), distribution.hops(&t, gate));
    }

    #[test]
    fn transfers_run_inside_the_sending_session() {
        let t = scenario_c();
        let gate = t.find(&["region-1", "gate-2"]).unwrap().id;
        let artifact = Artifact::new(ArtifactKind::CertificateBundle, "certs").place(
            gate,
            "ca.crt",
            cert("/pki/ca.crt"),
            file("/opt/fleet/certificates/ca.crt"),
        );
        let distribution = distribute(&artifact, &t).unwrap();
        let plan = build_plan(&t, &distribution, &credentials()).unwrap();

        let mut depths = Vec::new();
        plan.walk(|step, depth| {
            if let Step::Transfer(_) = step {
                depths.push(depth);
            }
        });
        // Operator shell, coordinator session, regional session.
        assert_eq!(vec![0, 1, 2], depths);
    }

    #[test]
    fn local_nodes_receive_at_their_owner() {
        let t = scenario_a();
        let north = t.find(&["north"]).unwrap().id;
        let artifact = Artifact::new(ArtifactKind::CertificateBundle, "certs").place(
            north,
            "ca.crt",
            cert("/pki/ca.crt"),
            file("/opt/fleet/certificates/ca.crt"),
        );
        let distribution = distribute(&artifact, &t).unwrap();
        let plan = build_plan(&t, &distribution, &credentials()).unwrap();

        assert_eq!(1, plan.transfers().len());
        assert_eq!(1, distribution.hops(&t, north));
        assert_eq!(vec![".tierdeploy-certs-ca.crt"], distribution.relayed_to(t.root().id));

        // Placement happens inside the coordinator's session.
        let root = plan.sessions()[0];
        let placed = root.steps.iter().any(|step| match step {
            Step::RunLocal(f) => f.lines.iter().any(|l| l.starts_with("install -D -m 0600")),
            _ => false,
        });
        assert!(placed);
    }

    #[test]
    fn sensor_placements_fold_into_edge() {
        let mut t = scenario_b();
        let gate = t.find(&["north", "gate"]).unwrap().id;
        let cam = t.attach(gate, "cam", Address::ssh("10.0.0.9")).unwrap();
        let artifact = Artifact::new(ArtifactKind::ConfigPayload, "sensor").place(
            cam,
            "cam.json",
            Content::Inline(b"{}".to_vec()),
            file("/opt/fleet/edge/cam.json"),
        );
        let distribution = distribute(&artifact, &t).unwrap();
        let plan = build_plan(&t, &distribution, &credentials()).unwrap();

        let mut targets = Vec::new();
        plan.walk(|step, _| {
            if let Step::RunLocal(f) = step {
                targets.push(f.node);
            }
        });
        assert_eq!(vec![Some(gate)], targets);
        assert!(plan.transfers().is_empty());
    }

    #[test]
    fn union_of_subtree_needs_is_relayed_once() {
        let t = scenario_c();
        let mut artifact = Artifact::new(ArtifactKind::CertificateBundle, "certs");
        for node in t.iter() {
            let name = match node.tier {
                Tier::Edge => "edge.crt",
                _ => "full.crt",
            };
            artifact = artifact.place(
                node.id,
                name,
                cert(&format!("/pki/{name}")),
                file(&format!("/opt/fleet/certificates/{name}")),
            );
        }
        let distribution = distribute(&artifact, &t).unwrap();
        let root = t.root().id;
        let region = t.find(&["region-1"]).unwrap().id;
        let gate = t.find(&["region-1", "gate-1"]).unwrap().id;

        assert_eq!(
            vec![".tierdeploy-certs-full.crt", ".tierdeploy-certs-edge.crt"],
            distribution.relayed_to(root),
        );
        assert_eq!(
            vec![".tierdeploy-certs-full.crt", ".tierdeploy-certs-edge.crt"],
            distribution.relayed_to(region),
        );
        assert_eq!(vec![".tierdeploy-certs-edge.crt"], distribution.relayed_to(gate));

        let plan = build_plan(&t, &distribution, &credentials()).unwrap();
        // 2 to the coordinator, 2 to each regional, 1 to each edge.
        assert_eq!(2 + 2 * 2 + 4, plan.transfers().len());
    }

    #[test]
    fn staging_is_cleaned_after_subtree() {
        let t = scenario_b();
        let gate = t.find(&["north", "gate"]).unwrap().id;
        let artifact = Artifact::new(ArtifactKind::CertificateBundle, "certs").place(
            gate,
            "ca.crt",
            cert("/pki/ca.crt"),
            file("/opt/fleet/certificates/ca.crt"),
        );
        let distribution = distribute(&artifact, &t).unwrap();
        let plan = build_plan(&t, &distribution, &credentials()).unwrap();
        let script = Script::compose(&plan).unwrap().render();

        let regional_body = script
            .split("<<'REGIONAL_1'\n")
            .nth(1)
            .and_then(|rest| rest.split("\nREGIONAL_1\n").next())
            .unwrap();
        let install = regional_body.find("install -D -m 0600 .tierdeploy-certs-ca.crt").unwrap();
        let cleanup = regional_body.find("rm -f .tierdeploy-certs-ca.crt").unwrap();
        assert!(install < cleanup);
        assert!(regional_body.ends_with("rm -f .tierdeploy-certs-ca.crt"));
    }

    #[test]
    fn conflicting_sources_are_rejected() {
        let t = scenario_c();
        let a = t.find(&["region-1"]).unwrap().id;
        let b = t.find(&["region-2"]).unwrap().id;
        let artifact = Artifact::new(ArtifactKind::CertificateBundle, "certs")
            .place(a, "ca.crt", cert("/pki/one/ca.crt"), file("/x"))
            .place(b, "ca.crt", cert("/pki/two/ca.crt"), file("/x"));
        let err = distribute(&artifact, &t).unwrap_err();
        assert!(matches!(err, Error::InvalidArtifact { .. }), "{err}");
    }

    #[test]
    fn file_names_must_be_plain() {
        let t = scenario_c();
        let artifact = Artifact::new(ArtifactKind::CertificateBundle, "certs").place(
            t.root().id,
            "../ca.crt",
            cert("/pki/ca.crt"),
            file("/x"),
        );
        assert!(distribute(&artifact, &t).is_err());
    }

    #[test]
    fn target_set_lists_receivers() {
        let t = scenario_c();
        let a = t.find(&["region-1"]).unwrap().id;
        let artifact = Artifact::new(ArtifactKind::CredentialRotation, "passwords")
            .place(a, "x", Content::Inline(vec![]), Destination::Pipe("chpasswd".into()))
            .place(a, "y", Content::Inline(vec![]), Destination::Pipe("chpasswd".into()));
        assert_eq!(BTreeSet::from([a]), artifact.target_set());
    }
}

mod placement {
    use super::*;

    fn lines_for(content: Content, destination: Destination) -> Vec<String> {
        let t = Topology::new("hq", Address::ssh("10.0.0.1")).unwrap();
        let artifact =
            Artifact::new(ArtifactKind::Release, "release").place(t.root().id, "app.tgz", content, destination);
        let distribution = distribute(&artifact, &t).unwrap();
        let plan = build_plan(&t, &distribution, &credentials()).unwrap();
        let mut lines = Vec::new();
        plan.walk(|step, depth| {
            if let (Step::RunLocal(f), 1) = (step, depth) {
                if f.label.contains("app.tgz") {
                    lines.extend(f.lines.clone());
                }
            }
        });
        lines
    }

    #[test]
    fn inline_file() {
        let lines = lines_for(Content::Inline(b"abc".to_vec()), file("/opt/fleet/a/b.json"));
        assert_eq!(
            vec![
                "mkdir -p /opt/fleet/a",
                "printf '%s' YWJj | base64 -d > /opt/fleet/a/b.json",
                "chmod 0600 /opt/fleet/a/b.json",
            ],
            lines,
        );
    }

    #[test]
    fn inline_pipe() {
        let lines = lines_for(Content::Inline(b"abc".to_vec()), Destination::Pipe("chpasswd".into()));
        assert_eq!(vec!["printf '%s' YWJj | base64 -d | chpasswd"], lines);
    }

    #[test]
    fn staged_extract() {
        let lines = lines_for(cert("/rel/app.tgz"), Destination::Extract("/opt/fleet/app".into()));
        assert_eq!(
            vec![
                "mkdir -p /opt/fleet/app",
                "tar -xzf .tierdeploy-release-app.tgz -C /opt/fleet/app",
            ],
            lines,
        );
    }

    #[test]
    fn staged_only() {
        let lines = lines_for(cert("/rel/app.tgz"), Destination::Staged);
        assert!(lines.is_empty());
    }
}

mod collect {
    use super::*;

    fn items(t: &Topology) -> Vec<CollectItem> {
        t.iter()
            .map(|node| CollectItem {
                node: node.id,
                remote_path: format!("/opt/fleet/{}/config.json", node.tier),
                local_path: t.local_dir(node).join("config.json"),
            })
            .collect()
    }

    #[test]
    fn relays_upward_after_each_session() {
        let t = scenario_b();
        let collection = collect("saved", items(&t), &t, "/sys").unwrap();
        let plan = build_plan(&t, &collection, &credentials()).unwrap();

        assert_eq!(
            vec![
                (
                    Direction::Download,
                    "north",
                    vec![
                        ".tierdeploy-saved-r1-0".to_string(),
                        ".tierdeploy-saved-r1-e1-0".to_string(),
                    ],
                    ".".to_string(),
                ),
                (
                    Direction::Download,
                    "hq",
                    vec![
                        ".tierdeploy-saved-root-0".to_string(),
                        ".tierdeploy-saved-r1-0".to_string(),
                        ".tierdeploy-saved-r1-e1-0".to_string(),
                    ],
                    "/sys/".to_string(),
                ),
            ],
            copies(&t, plan.transfers()),
        );

        let gate = t.find(&["north", "gate"]).unwrap().id;
        assert_eq!(2, collection.hops(&t, gate));
    }

    #[test]
    fn organizes_into_node_directories() {
        let t = scenario_b();
        let collection = collect("saved", items(&t), &t, "/sys").unwrap();
        let plan = build_plan(&t, &collection, &credentials()).unwrap();
        let Some(Step::RunLocal(organize)) = plan.steps.last() else {
            panic!("expected the organize step last");
        };
        assert!(organize
            .lines
            .contains(&"mv /sys/.tierdeploy-saved-r1-e1-0 /sys/north/gate/config.json".to_string()));
        assert!(organize
            .lines
            .contains(&"mv /sys/.tierdeploy-saved-root-0 /sys/config.json".to_string()));
    }

    #[test]
    fn stages_with_cleanup_first() {
        let t = scenario_b();
        let collection = collect("saved", items(&t), &t, "/sys").unwrap();
        let plan = build_plan(&t, &collection, &credentials()).unwrap();
        let regional = plan.sessions()[1];
        let Step::RunLocal(first) = &regional.steps[0] else {
            panic!("expected staging fragment");
        };
        assert_eq!(
            vec![
                "rm -f .tierdeploy-saved-*",
                "cp /opt/fleet/regional/config.json .tierdeploy-saved-r1-0",
            ],
            first.lines,
        );
    }

    #[test]
    fn layers_with_operations() {
        let t = scenario_a();
        let collection = collect("saved", items(&t), &t, "/sys").unwrap();
        let echo = echo_actions();
        let layered = Layered::new().with(&echo).with(&collection);
        let plan = build_plan(&t, &layered, &credentials()).unwrap();
        Script::compose(&plan).unwrap();
    }
}
