use kube::CustomResourceExt;
fn main() {
    print!(
        "{}",
        serde_yaml::to_string(
            &namespace_label_operator::resources::namespacelabels::NamespaceLabel::crd()
        )
        .unwrap()
    )
}
