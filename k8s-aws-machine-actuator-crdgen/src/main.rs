use k8s_aws_machine_actuator::model::Machine;
use kube::CustomResourceExt;

fn main() {
    print!("{}", serde_yaml::to_string(&Machine::crd()).unwrap())
}
